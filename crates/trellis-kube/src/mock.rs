//! Mock provider for testing
//!
//! Stores resources in memory, useful for unit tests without requiring a
//! Kubernetes cluster. Ships with the builtin kinds pre-registered so GVR
//! resolution behaves like a real cluster; extra kinds (including
//! deliberately ambiguous ones) can be added per test.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{KubeError, Result, api_error};
use crate::gvr::{GvrResolver, ResourceSpec};
use crate::provider::Provider;

/// Counts of operations performed, for testing assertions.
#[derive(Debug, Default, Clone)]
pub struct OperationCounts {
    pub lists: usize,
    pub gets: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub patches: usize,
}

/// In-memory provider for testing.
#[derive(Clone)]
pub struct MockProvider {
    specs: Vec<ResourceSpec>,
    resolver: GvrResolver,
    /// resource plural -> stored bodies
    store: Arc<RwLock<HashMap<String, Vec<Value>>>>,
    operations: Arc<RwLock<OperationCounts>>,
    dry_run: Arc<AtomicBool>,
    field_paths: BTreeMap<String, Vec<String>>,
    contexts: HashMap<String, Arc<MockProvider>>,
}

impl MockProvider {
    /// Provider with the builtin kinds and an empty store.
    pub fn new() -> Self {
        let specs = builtin_specs();
        let resolver = GvrResolver::from_specs(specs.clone());
        Self {
            specs,
            resolver,
            store: Arc::new(RwLock::new(HashMap::new())),
            operations: Arc::new(RwLock::new(OperationCounts::default())),
            dry_run: Arc::new(AtomicBool::new(false)),
            field_paths: BTreeMap::new(),
            contexts: HashMap::new(),
        }
    }

    /// Register an additional kind (CRDs, or a second group to provoke
    /// ambiguity).
    pub fn add_spec(&mut self, spec: ResourceSpec) {
        self.specs.push(spec);
        self.resolver = GvrResolver::from_specs(self.specs.clone());
    }

    /// Seed a resource under its plural.
    pub fn insert(&self, plural: &str, resource: Value) {
        let mut store = self.store.write().unwrap();
        store.entry(plural.to_string()).or_default().push(resource);
    }

    /// Everything stored under a plural, for assertions.
    pub fn stored(&self, plural: &str) -> Vec<Value> {
        let store = self.store.read().unwrap();
        store.get(plural).cloned().unwrap_or_default()
    }

    /// Configure the flattened field paths returned by
    /// `open_api_field_paths`.
    pub fn set_field_paths(&mut self, field_paths: BTreeMap<String, Vec<String>>) {
        self.field_paths = field_paths;
    }

    /// Register a sibling provider reachable through `for_context`.
    pub fn register_context(&mut self, name: &str, provider: Arc<MockProvider>) {
        self.contexts.insert(name.to_string(), provider);
    }

    /// Get operation counts for assertions.
    pub fn operation_counts(&self) -> OperationCounts {
        self.operations.read().unwrap().clone()
    }

    fn position(&self, plural: &str, name: &str, namespace: Option<&str>) -> Option<usize> {
        let store = self.store.read().unwrap();
        store.get(plural)?.iter().position(|r| {
            r["metadata"]["name"].as_str() == Some(name)
                && (namespace.is_none() || r["metadata"]["namespace"].as_str() == namespace)
        })
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn find_gvr(&self, kind: &str) -> Result<ResourceSpec> {
        Ok(self.resolver.find(kind)?.clone())
    }

    async fn get_resources(
        &self,
        kind: &str,
        field_selector: Option<&str>,
        label_selector: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>> {
        self.operations.write().unwrap().lists += 1;
        let spec = self.resolver.find(kind)?.clone();
        let store = self.store.read().unwrap();
        let items = store.get(&spec.resource).cloned().unwrap_or_default();
        Ok(items
            .into_iter()
            .filter(|r| {
                if spec.namespaced {
                    if let Some(ns) = namespace {
                        if r["metadata"]["namespace"].as_str() != Some(ns) {
                            return false;
                        }
                    }
                }
                matches_field_selector(r, field_selector) && matches_label_selector(r, label_selector)
            })
            .collect())
    }

    async fn get_resource(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<Value> {
        self.operations.write().unwrap().gets += 1;
        let spec = self.resolver.find(kind)?.clone();
        let index = self
            .position(&spec.resource, name, namespace)
            .ok_or_else(|| api_error(404, "NotFound", format!("{} '{name}' not found", spec.resource)))?;
        let store = self.store.read().unwrap();
        Ok(store[&spec.resource][index].clone())
    }

    async fn create_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        body: Value,
    ) -> Result<()> {
        self.operations.write().unwrap().creates += 1;
        let spec = self.resolver.find(kind)?.clone();
        if self.position(&spec.resource, name, namespace).is_some() {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} '{name}' already exists", spec.resource),
            ));
        }
        if self.dry_run() {
            return Ok(());
        }
        let mut store = self.store.write().unwrap();
        store.entry(spec.resource).or_default().push(body);
        Ok(())
    }

    async fn delete_resource(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<()> {
        self.operations.write().unwrap().deletes += 1;
        let spec = self.resolver.find(kind)?.clone();
        let index = self
            .position(&spec.resource, name, namespace)
            .ok_or_else(|| api_error(404, "NotFound", format!("{} '{name}' not found", spec.resource)))?;
        if self.dry_run() {
            return Ok(());
        }
        let mut store = self.store.write().unwrap();
        store.get_mut(&spec.resource).unwrap().remove(index);
        Ok(())
    }

    async fn patch_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        patch: Value,
    ) -> Result<()> {
        self.operations.write().unwrap().patches += 1;
        let spec = self.resolver.find(kind)?.clone();
        let index = self
            .position(&spec.resource, name, namespace)
            .ok_or_else(|| api_error(404, "NotFound", format!("{} '{name}' not found", spec.resource)))?;
        if self.dry_run() {
            return Ok(());
        }
        let ops = patch
            .as_array()
            .ok_or_else(|| KubeError::InvalidPatch("patch document must be an array".to_string()))?
            .clone();
        let mut store = self.store.write().unwrap();
        let target = &mut store.get_mut(&spec.resource).unwrap()[index];
        for op in ops {
            let path = op["path"].as_str().unwrap_or_default();
            match op["op"].as_str() {
                // The real provider materialises absent parents; the mock
                // mirrors that observable behaviour.
                Some("add") | Some("replace") => pointer_set(target, path, op["value"].clone()),
                Some("remove") => pointer_remove(target, path),
                Some("test") | None | Some(_) => {}
            }
        }
        Ok(())
    }

    async fn update_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        body: Value,
    ) -> Result<Value> {
        self.operations.write().unwrap().updates += 1;
        let spec = self.resolver.find(kind)?.clone();
        let index = self
            .position(&spec.resource, name, namespace)
            .ok_or_else(|| api_error(404, "NotFound", format!("{} '{name}' not found", spec.resource)))?;
        if self.dry_run() {
            return Ok(body);
        }
        let mut store = self.store.write().unwrap();
        store.get_mut(&spec.resource).unwrap()[index] = body.clone();
        Ok(body)
    }

    async fn is_namespaced(&self, kind: &str) -> Result<bool> {
        Ok(self.resolver.find(kind)?.namespaced)
    }

    async fn open_api_field_paths(&self) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(self.field_paths.clone())
    }

    async fn for_context(&self, context: &str) -> Result<Arc<dyn Provider>> {
        self.contexts
            .get(context)
            .map(|p| Arc::clone(p) as Arc<dyn Provider>)
            .ok_or_else(|| KubeError::Config(format!("unknown context '{context}'")))
    }

    fn set_dry_run(&self, enabled: bool) {
        self.dry_run.store(enabled, Ordering::Relaxed);
    }

    fn dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Relaxed)
    }
}

fn matches_field_selector(resource: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else { return true };
    selector.split(',').all(|clause| {
        match clause.split_once('=') {
            Some(("metadata.name", wanted)) => resource["metadata"]["name"].as_str() == Some(wanted),
            Some(("metadata.namespace", wanted)) => {
                resource["metadata"]["namespace"].as_str() == Some(wanted)
            }
            // Unknown field selectors are not supported by the fixture.
            _ => false,
        }
    })
}

fn matches_label_selector(resource: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else { return true };
    let labels = &resource["metadata"]["labels"];
    selector.split(',').all(|clause| match clause.split_once('=') {
        Some((key, wanted)) => labels[key].as_str() == Some(wanted),
        None => false,
    })
}

/// Set a value at a JSON pointer, creating intermediate objects and arrays.
fn pointer_set(target: &mut Value, pointer: &str, value: Value) {
    let segments: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect();
    let mut current = target;
    for (position, segment) in segments.iter().enumerate() {
        let last = position + 1 == segments.len();
        if let Ok(index) = segment.parse::<usize>() {
            if !current.is_array() {
                *current = Value::Array(Vec::new());
            }
            let items = current.as_array_mut().unwrap();
            while items.len() <= index {
                items.push(Value::Null);
            }
            if last {
                items[index] = value;
                return;
            }
            current = &mut items[index];
        } else {
            if !current.is_object() {
                *current = Value::Object(serde_json::Map::new());
            }
            let map = current.as_object_mut().unwrap();
            if last {
                map.insert(segment.clone(), value);
                return;
            }
            current = map.entry(segment.clone()).or_insert(Value::Null);
        }
    }
}

fn pointer_remove(target: &mut Value, pointer: &str) {
    let Some((parent, key)) = pointer.rsplit_once('/') else {
        return;
    };
    let parent = if parent.is_empty() {
        Some(target)
    } else {
        target.pointer_mut(parent)
    };
    if let Some(parent) = parent {
        if let Some(map) = parent.as_object_mut() {
            map.remove(key);
        } else if let (Some(items), Ok(index)) = (parent.as_array_mut(), key.parse::<usize>()) {
            if index < items.len() {
                items.remove(index);
            }
        }
    }
}

fn spec(
    group: &str,
    resource: &str,
    kind: &str,
    singular: &str,
    short_names: &[&str],
    namespaced: bool,
) -> ResourceSpec {
    ResourceSpec {
        group: group.to_string(),
        version: "v1".to_string(),
        resource: resource.to_string(),
        kind: kind.to_string(),
        singular: singular.to_string(),
        short_names: short_names.iter().map(|s| s.to_string()).collect(),
        namespaced,
    }
}

/// The builtin kinds a vanilla cluster discovers.
fn builtin_specs() -> Vec<ResourceSpec> {
    vec![
        spec("", "pods", "Pod", "pod", &["po"], true),
        spec("", "services", "Service", "service", &["svc"], true),
        spec("", "endpoints", "Endpoints", "endpoints", &["ep"], true),
        spec("", "configmaps", "ConfigMap", "configmap", &["cm"], true),
        spec("", "secrets", "Secret", "secret", &[], true),
        spec("", "namespaces", "Namespace", "namespace", &["ns"], false),
        spec("", "nodes", "Node", "node", &["no"], false),
        spec("", "serviceaccounts", "ServiceAccount", "serviceaccount", &["sa"], true),
        spec("", "persistentvolumes", "PersistentVolume", "persistentvolume", &["pv"], false),
        spec("", "persistentvolumeclaims", "PersistentVolumeClaim", "persistentvolumeclaim", &["pvc"], true),
        spec("apps", "deployments", "Deployment", "deployment", &["deploy"], true),
        spec("apps", "replicasets", "ReplicaSet", "replicaset", &["rs"], true),
        spec("apps", "statefulsets", "StatefulSet", "statefulset", &["sts"], true),
        spec("apps", "daemonsets", "DaemonSet", "daemonset", &["ds"], true),
        spec("batch", "jobs", "Job", "job", &[], true),
        spec("batch", "cronjobs", "CronJob", "cronjob", &["cj"], true),
        spec("networking.k8s.io", "ingresses", "Ingress", "ingress", &["ing"], true),
        spec("networking.k8s.io", "networkpolicies", "NetworkPolicy", "networkpolicy", &["netpol"], true),
        spec("storage.k8s.io", "storageclasses", "StorageClass", "storageclass", &["sc"], false),
        spec("policy", "poddisruptionbudgets", "PodDisruptionBudget", "poddisruptionbudget", &["pdb"], true),
        spec("autoscaling", "horizontalpodautoscalers", "HorizontalPodAutoscaler", "horizontalpodautoscaler", &["hpa"], true),
        spec("rbac.authorization.k8s.io", "roles", "Role", "role", &[], true),
        spec("rbac.authorization.k8s.io", "rolebindings", "RoleBinding", "rolebinding", &[], true),
        spec("rbac.authorization.k8s.io", "clusterroles", "ClusterRole", "clusterrole", &[], false),
        spec("rbac.authorization.k8s.io", "clusterrolebindings", "ClusterRoleBinding", "clusterrolebinding", &[], false),
        spec("admissionregistration.k8s.io", "mutatingwebhookconfigurations", "MutatingWebhookConfiguration", "mutatingwebhookconfiguration", &[], false),
        spec("admissionregistration.k8s.io", "validatingwebhookconfigurations", "ValidatingWebhookConfiguration", "validatingwebhookconfiguration", &[], false),
    ]
}
