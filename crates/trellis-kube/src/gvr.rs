//! Resource kind resolution
//!
//! Maps every name a user may write for a resource kind - CamelCase kind,
//! plural, singular, short name, or fully-qualified `resource.group` - onto
//! its `(group, version, resource)` triple. Bare names are case-insensitive;
//! the qualified form is exact. A bare name present in several groups is an
//! error listing every qualified alternative.

use std::collections::HashMap;

use kube::api::ApiResource;

use crate::error::{KubeError, Result};

/// Everything resolution needs to know about one discovered resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    /// API group; empty for the core group.
    pub group: String,
    pub version: String,
    /// Canonical plural, e.g. `deployments`.
    pub resource: String,
    /// CamelCase kind, e.g. `Deployment`.
    pub kind: String,
    /// Lowercase singular; may be empty when the server omits it.
    pub singular: String,
    pub short_names: Vec<String>,
    pub namespaced: bool,
}

impl ResourceSpec {
    /// The fully-qualified name: `resource.group`, or the bare plural for
    /// the core group.
    pub fn qualified_name(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }

    /// `group/version`, or `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// The kube `ApiResource` for building dynamic clients.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.resource.clone(),
        }
    }
}

/// Alias table over a set of discovered resource specs.
#[derive(Debug, Clone, Default)]
pub struct GvrResolver {
    specs: Vec<ResourceSpec>,
    /// Lowercased bare aliases; several specs may share one.
    aliases: HashMap<String, Vec<usize>>,
    /// Exact `resource.group` names.
    qualified: HashMap<String, usize>,
}

impl GvrResolver {
    pub fn from_specs(specs: Vec<ResourceSpec>) -> Self {
        let mut resolver = Self {
            specs,
            aliases: HashMap::new(),
            qualified: HashMap::new(),
        };
        for (index, spec) in resolver.specs.iter().enumerate() {
            let mut names = vec![spec.kind.to_lowercase(), spec.resource.to_lowercase()];
            if !spec.singular.is_empty() {
                names.push(spec.singular.to_lowercase());
            }
            names.extend(spec.short_names.iter().map(|s| s.to_lowercase()));
            for name in names {
                let entry = resolver.aliases.entry(name).or_default();
                if !entry.contains(&index) {
                    entry.push(index);
                }
            }
            resolver.qualified.insert(spec.qualified_name(), index);
        }
        resolver
    }

    pub fn specs(&self) -> &[ResourceSpec] {
        &self.specs
    }

    /// Resolve a name written by a user to its resource spec.
    pub fn find(&self, name: &str) -> Result<&ResourceSpec> {
        // Fully-qualified form first: exact, case-sensitive.
        if let Some(&index) = self.qualified.get(name) {
            return Ok(&self.specs[index]);
        }
        match self.aliases.get(&name.to_lowercase()) {
            Some(indices) if indices.len() == 1 => Ok(&self.specs[indices[0]]),
            Some(indices) if indices.len() > 1 => {
                let mut candidates: Vec<String> = indices
                    .iter()
                    .map(|&i| self.specs[i].qualified_name())
                    .collect();
                candidates.sort();
                Err(KubeError::AmbiguousKind {
                    name: name.to_string(),
                    candidates,
                })
            }
            _ => Err(KubeError::GvrNotFound {
                name: name.to_string(),
            }),
        }
    }
}
