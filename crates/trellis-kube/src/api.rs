//! Kube-backed provider
//!
//! `ApiProvider` talks to a real API server through `kube`. Lists funnel
//! through a single-consumer queue with one slot and a short pacing sleep,
//! so burst traffic never trips API-server throttling; mutations take a
//! write lock while lists share a read lock. Every mutation honours the
//! process-wide dry-run flag by setting the server dry-run directive.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, ObjectList, Patch, PatchParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::Value;
use tokio::sync::{OnceCell, RwLock, mpsc, oneshot};
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

use crate::error::{KubeError, Result};
use crate::gvr::{GvrResolver, ResourceSpec};
use crate::openapi;
use crate::patch::{PatchPlan, analyse, container_merge, materialise_parents};
use crate::provider::Provider;

/// Field manager for create and patch requests.
const FIELD_MANAGER: &str = "trellis";

/// Sleep preceding every list request, paces the queue consumer.
const LIST_PACING: Duration = Duration::from_millis(10);

/// Provider backed by a live cluster connection.
pub struct ApiProvider {
    client: Client,
    resolver: OnceCell<GvrResolver>,
    lists: ListQueue,
    mutation_lock: Arc<RwLock<()>>,
    dry_run: Arc<AtomicBool>,
    field_paths: OnceCell<BTreeMap<String, Vec<String>>>,
}

impl ApiProvider {
    /// Build a provider over an existing client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resolver: OnceCell::new(),
            lists: ListQueue::spawn(),
            mutation_lock: Arc::new(RwLock::new(())),
            dry_run: Arc::new(AtomicBool::new(false)),
            field_paths: OnceCell::new(),
        }
    }

    /// Infer configuration (in-cluster first, then `KUBECONFIG`).
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn resolver(&self) -> Result<&GvrResolver> {
        self.resolver
            .get_or_try_init(|| discover(&self.client))
            .await
    }

    fn api_for(&self, spec: &ResourceSpec, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = spec.api_resource();
        match (spec.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: self.dry_run(),
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }

    fn patch_params(&self) -> PatchParams {
        let mut params = PatchParams::default();
        params.dry_run = self.dry_run();
        params.field_manager = Some(FIELD_MANAGER.to_string());
        params
    }
}

#[async_trait]
impl Provider for ApiProvider {
    async fn find_gvr(&self, kind: &str) -> Result<ResourceSpec> {
        Ok(self.resolver().await?.find(kind)?.clone())
    }

    async fn get_resources(
        &self,
        kind: &str,
        field_selector: Option<&str>,
        label_selector: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>> {
        let _read = self.mutation_lock.read().await;
        let spec = self.find_gvr(kind).await?;
        let api = self.api_for(&spec, namespace);
        let mut params = ListParams::default();
        if let Some(fields) = field_selector {
            params = params.fields(fields);
        }
        if let Some(labels) = label_selector {
            params = params.labels(labels);
        }
        let list = self.lists.list(api, params).await?;
        list.items
            .into_iter()
            .map(|item| serde_json::to_value(item).map_err(KubeError::from))
            .collect()
    }

    async fn get_resource(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<Value> {
        let _read = self.mutation_lock.read().await;
        let spec = self.find_gvr(kind).await?;
        let api = self.api_for(&spec, namespace);
        let object = api.get(name).await?;
        Ok(serde_json::to_value(object)?)
    }

    async fn create_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        body: Value,
    ) -> Result<()> {
        let _write = self.mutation_lock.write().await;
        let spec = self.find_gvr(kind).await?;
        debug!(kind = %spec.resource, name, "creating resource");
        let api = self.api_for(&spec, namespace);
        let object: DynamicObject = serde_json::from_value(body)?;
        api.create(&self.post_params(), &object).await?;
        Ok(())
    }

    async fn delete_resource(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<()> {
        let _write = self.mutation_lock.write().await;
        let spec = self.find_gvr(kind).await?;
        debug!(kind = %spec.resource, name, "deleting resource");
        let api = self.api_for(&spec, namespace);
        let params = DeleteParams {
            dry_run: self.dry_run(),
            ..Default::default()
        };
        api.delete(name, &params).await?;
        Ok(())
    }

    async fn patch_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        patch: Value,
    ) -> Result<()> {
        let _write = self.mutation_lock.write().await;
        let spec = self.find_gvr(kind).await?;
        let api = self.api_for(&spec, namespace);
        let params = self.patch_params();

        match analyse(&patch)? {
            PatchPlan::StrategicMerge(body) => {
                api.patch(name, &params, &Patch::Strategic(body)).await?;
            }
            PatchPlan::ContainerMerge { index, ops } => {
                // Strategic merge keys containers by name, so read it first.
                let current = api.get(name).await?;
                let current = serde_json::to_value(&current)?;
                let container_name = current["spec"]["template"]["spec"]["containers"]
                    .get(index)
                    .and_then(|c| c["name"].as_str())
                    .ok_or_else(|| {
                        KubeError::InvalidPatch(format!("no container at index {index} in {name}"))
                    })?;
                let body = container_merge(container_name, &ops)?;
                api.patch(name, &params, &Patch::Strategic(body)).await?;
            }
            PatchPlan::JsonPatch {
                patch,
                test_fallbacks,
            } => {
                let document: json_patch::Patch = serde_json::from_value(patch.clone())?;
                match api.patch(name, &params, &Patch::<Value>::Json(document)).await {
                    Ok(_) => {}
                    Err(error) if !test_fallbacks.is_empty() => {
                        // A guarded test failed: materialise the parents and retry.
                        warn!(kind = %spec.resource, name, %error, "patch test failed, materialising parents");
                        let prelude: json_patch::Patch =
                            serde_json::from_value(materialise_parents(&test_fallbacks))?;
                        api.patch(name, &params, &Patch::<Value>::Json(prelude)).await?;
                        let document: json_patch::Patch = serde_json::from_value(patch)?;
                        api.patch(name, &params, &Patch::<Value>::Json(document)).await?;
                    }
                    Err(error) => return Err(error.into()),
                }
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
        let _write = self.mutation_lock.write().await;
        let spec = self.find_gvr(kind).await?;
        let api = self.api_for(&spec, namespace);
        let object: DynamicObject = serde_json::from_value(body)?;
        let stored = api.replace(name, &self.post_params(), &object).await?;
        Ok(serde_json::to_value(stored)?)
    }

    async fn is_namespaced(&self, kind: &str) -> Result<bool> {
        Ok(self.find_gvr(kind).await?.namespaced)
    }

    async fn open_api_field_paths(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let resolver = self.resolver().await?.clone();
        self.field_paths
            .get_or_try_init(|| openapi::fetch_field_paths(&self.client, &resolver))
            .await
            .cloned()
    }

    async fn for_context(&self, context: &str) -> Result<Arc<dyn Provider>> {
        let kubeconfig = Kubeconfig::read().map_err(|e| KubeError::Config(e.to_string()))?;
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| KubeError::Config(e.to_string()))?;
        let client = Client::try_from(config)?;
        let mut provider = ApiProvider::new(client);
        // The dry-run flag is process-wide; siblings share it.
        provider.dry_run = Arc::clone(&self.dry_run);
        Ok(Arc::new(provider))
    }

    fn set_dry_run(&self, enabled: bool) {
        self.dry_run.store(enabled, Ordering::Relaxed);
    }

    fn dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Relaxed)
    }
}

/// Raw discovery across the core group and every named group, keeping the
/// preferred version of each. Subresources (`pods/log`) are skipped.
async fn discover(client: &Client) -> Result<GvrResolver> {
    let mut specs = Vec::new();

    let core = client.list_core_api_versions().await?;
    if let Some(version) = core.versions.first() {
        let list = client.list_core_api_resources(version).await?;
        for resource in &list.resources {
            if let Some(spec) = spec_from_api_resource("", version, resource) {
                specs.push(spec);
            }
        }
    }

    let groups = client.list_api_groups().await?;
    for group in &groups.groups {
        let Some(group_version) = group
            .preferred_version
            .as_ref()
            .or_else(|| group.versions.first())
            .map(|v| v.group_version.clone())
        else {
            continue;
        };
        let list = match client.list_api_group_resources(&group_version).await {
            Ok(list) => list,
            Err(error) => {
                warn!(group = %group.name, %error, "skipping undiscoverable group");
                continue;
            }
        };
        let version = group_version
            .split_once('/')
            .map(|(_, v)| v)
            .unwrap_or(group_version.as_str());
        for resource in &list.resources {
            if let Some(spec) = spec_from_api_resource(&group.name, version, resource) {
                specs.push(spec);
            }
        }
    }

    if specs.is_empty() {
        return Err(KubeError::Discovery("no resources discovered".to_string()));
    }
    Ok(GvrResolver::from_specs(specs))
}

fn spec_from_api_resource(
    group: &str,
    version: &str,
    resource: &k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource,
) -> Option<ResourceSpec> {
    if resource.name.contains('/') {
        return None;
    }
    Some(ResourceSpec {
        group: group.to_string(),
        version: version.to_string(),
        resource: resource.name.clone(),
        kind: resource.kind.clone(),
        singular: resource.singular_name.clone(),
        short_names: resource.short_names.clone().unwrap_or_default(),
        namespaced: resource.namespaced,
    })
}

struct ListRequest {
    api: Api<DynamicObject>,
    params: ListParams,
    reply: oneshot::Sender<std::result::Result<ObjectList<DynamicObject>, kube::Error>>,
}

/// Single-consumer list queue: a one-slot channel serialises requests, the
/// worker paces them with a short sleep.
#[derive(Clone)]
struct ListQueue {
    tx: mpsc::Sender<ListRequest>,
}

impl ListQueue {
    fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<ListRequest>(1);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                sleep(LIST_PACING).await;
                let result = request.api.list(&request.params).await;
                let _ = request.reply.send(result);
            }
        });
        Self { tx }
    }

    async fn list(
        &self,
        api: Api<DynamicObject>,
        params: ListParams,
    ) -> Result<ObjectList<DynamicObject>> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ListRequest { api, params, reply })
            .await
            .map_err(|_| KubeError::Discovery("list queue closed".to_string()))?;
        response
            .await
            .map_err(|_| KubeError::Discovery("list worker stopped".to_string()))?
            .map_err(KubeError::Api)
    }
}
