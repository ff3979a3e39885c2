//! The operator-CRD reconciler
//!
//! Manages the lifecycle of per-operator watchers: one watcher per
//! `namespace/name` key, replaced on spec change, stopped on deletion.
//! The watchers themselves deliver events (see [`crate::watcher`]); this
//! controller only starts and stops them.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::watcher::Config as WatchConfig;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::crd::{DynamicOperator, FINALIZER};
use crate::error::{OperatorError, Result};
use crate::handler::EventHandlers;
use crate::watcher::{self, WatcherRegistry};

/// State shared by every reconcile.
pub struct Context {
    pub client: Client,
    pub handlers: Arc<EventHandlers>,
    pub watchers: Arc<WatcherRegistry>,
}

async fn reconcile(operator: Arc<DynamicOperator>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = operator.namespace().ok_or_else(|| {
        OperatorError::InvalidSpec("DynamicOperator must be namespaced".to_string())
    })?;
    let name = operator.name_any();
    let key = format!("{namespace}/{name}");
    let api: Api<DynamicOperator> = Api::namespaced(ctx.client.clone(), &namespace);

    // Work from a fresh read; the cached object may lag behind.
    let Some(current) = api.get_opt(&name).await? else {
        ctx.watchers.stop(&key).await;
        return Ok(Action::await_change());
    };

    if current.meta().deletion_timestamp.is_some() {
        info!(%key, "operator deleted, stopping watcher");
        ctx.watchers.stop(&key).await;
        remove_finalizer(&api, &current, &name).await?;
        return Ok(Action::await_change());
    }

    current.spec.validate()?;

    // A spec change lands here too: cancel the old watcher before starting
    // its replacement.
    ctx.watchers.stop(&key).await;
    ensure_finalizer(&api, &current, &name).await?;

    info!(%key, resource_kind = %current.spec.resource_kind, "starting watcher");
    let handle = watcher::start(
        ctx.client.clone(),
        Arc::clone(&ctx.handlers),
        current.clone(),
    )
    .await?;
    ctx.watchers.insert(key, handle).await;

    let status = json!({
        "status": {
            "activeWatchers": ctx.watchers.count().await as i32,
        }
    });
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
        .await?;

    Ok(Action::await_change())
}

fn error_policy(operator: Arc<DynamicOperator>, error: &OperatorError, _ctx: Arc<Context>) -> Action {
    warn!(operator = %operator.name_any(), %error, "reconcile failed");
    Action::requeue(Duration::from_secs(60))
}

async fn ensure_finalizer(
    api: &Api<DynamicOperator>,
    operator: &DynamicOperator,
    name: &str,
) -> Result<()> {
    if operator.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let mut finalizers = operator.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_finalizer(
    api: &Api<DynamicOperator>,
    operator: &DynamicOperator,
    name: &str,
) -> Result<()> {
    let finalizers: Vec<String> = operator
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    if finalizers.len() == operator.finalizers().len() {
        return Ok(());
    }
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Run the controller until shutdown. Exits the process when the CRD is
/// not installed, the only fatal setup condition.
pub async fn run(ctx: Context) {
    let operators = Api::<DynamicOperator>::all(ctx.client.clone());
    if let Err(error) = operators.list(&ListParams::default().limit(1)).await {
        error!(%error, "DynamicOperator CRD is not queryable; is it installed?");
        info!("install it with: crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let watchers = Arc::clone(&ctx.watchers);
    Controller::new(operators, WatchConfig::default().any_semantic())
        .with_config(ControllerConfig::default().concurrency(1))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|result| async move { result.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;

    watchers.stop_all().await;
}
