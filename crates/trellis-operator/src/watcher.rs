//! Per-operator resource watchers
//!
//! Each reconciled operator owns one watcher task over its resource kind,
//! scoped to its namespace (cluster-wide when unset). The watch stream is
//! classified into create / update / delete events; an update carrying a
//! deletion timestamp is routed to the delete handler, since watched
//! resources may pass through a terminating state before disappearing.
//!
//! The registry guarantees at most one active watcher per operator key:
//! inserting under an existing key cancels the old task first.

use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::Arc;

use futures::TryStreamExt;
use kube::Client;
use kube::api::{Api, DynamicObject};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{Config as WatchConfig, Event, watcher};
use serde_json::Value;
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crd::DynamicOperator;
use crate::error::Result;
use crate::handler::{EventHandlers, EventKind};

/// A running watcher and its cancellation handle.
pub struct WatcherHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn cancel(self) {
        self.token.cancel();
        self.task.abort();
    }
}

/// Active watchers keyed by `namespace/name` of the owning operator.
#[derive(Default)]
pub struct WatcherRegistry {
    inner: RwLock<HashMap<String, WatcherHandle>>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Cancel and drop the watcher for a key, if any.
    pub async fn stop(&self, key: &str) {
        if let Some(handle) = self.inner.write().await.remove(key) {
            debug!(key, "stopping watcher");
            handle.cancel();
        }
    }

    /// Register a watcher for a key, cancelling any previous one.
    pub async fn insert(&self, key: String, handle: WatcherHandle) {
        let mut inner = self.inner.write().await;
        if let Some(previous) = inner.remove(&key) {
            previous.cancel();
        }
        inner.insert(key, handle);
    }

    /// Cancel everything (process shutdown).
    pub async fn stop_all(&self) {
        let mut inner = self.inner.write().await;
        for (_, handle) in inner.drain() {
            handle.cancel();
        }
    }
}

/// Start a watcher for an operator and wait for its initial listing to
/// complete before returning the handle.
pub async fn start(
    client: Client,
    handlers: Arc<EventHandlers>,
    operator: DynamicOperator,
) -> Result<WatcherHandle> {
    let spec = handlers
        .provider()
        .find_gvr(&operator.spec.resource_kind)
        .await?;
    let ar = spec.api_resource();
    let api: Api<DynamicObject> = match operator.spec.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => {
            Api::namespaced_with(client, namespace, &ar)
        }
        _ => Api::all_with(client, &ar),
    };

    let token = CancellationToken::new();
    let (ready_tx, ready_rx) = oneshot::channel();
    let task = tokio::spawn(watch_loop(api, handlers, operator, token.clone(), ready_tx));
    // Cache sync: the first InitDone signals readiness.
    let _ = ready_rx.await;
    Ok(WatcherHandle { token, task })
}

async fn watch_loop(
    api: Api<DynamicObject>,
    handlers: Arc<EventHandlers>,
    operator: DynamicOperator,
    token: CancellationToken,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready = Some(ready_tx);
    let mut known: HashSet<String> = HashSet::new();
    let mut terminating: HashSet<String> = HashSet::new();

    let stream = watcher(api, WatchConfig::default()).default_backoff();
    let mut stream = pin!(stream);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            event = stream.try_next() => match event {
                Ok(Some(Event::Init)) => {}
                Ok(Some(Event::InitDone)) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                }
                Ok(Some(Event::InitApply(object) | Event::Apply(object))) => {
                    let Ok(value) = serde_json::to_value(&object) else { continue };
                    let key = object_key(&value);
                    let deleting = value["metadata"]["deletionTimestamp"].is_string();
                    let kind = if deleting {
                        // Terminating update: route to the delete handler.
                        if !terminating.insert(key.clone()) {
                            continue;
                        }
                        EventKind::Delete
                    } else if known.insert(key.clone()) {
                        EventKind::Create
                    } else {
                        EventKind::Update
                    };
                    handlers.dispatch(&operator, kind, &value).await;
                }
                Ok(Some(Event::Delete(object))) => {
                    let Ok(value) = serde_json::to_value(&object) else { continue };
                    let key = object_key(&value);
                    known.remove(&key);
                    if terminating.remove(&key) {
                        // The delete handler already ran for this resource.
                        continue;
                    }
                    handlers.dispatch(&operator, EventKind::Delete, &value).await;
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(
                        resource_kind = %operator.spec.resource_kind,
                        %error,
                        "watch stream error, backing off"
                    );
                }
            }
        }
    }
}

fn object_key(object: &Value) -> String {
    format!(
        "{}/{}",
        object["metadata"]["namespace"].as_str().unwrap_or(""),
        object["metadata"]["name"].as_str().unwrap_or("")
    )
}
