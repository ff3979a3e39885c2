//! Owner-reference attachment
//!
//! After a CREATE, the triggering resources become owners of what was
//! created: the created resource is fetched, an owner reference is
//! composed from each owner's identity, and the update retries on
//! conflict with linear backoff. Owners already referenced by uid are
//! skipped, so repeated attachment is idempotent.

use serde_json::{Value, json};
use tokio::time::{Duration, sleep};
use tracing::debug;

use trellis_core::result::CreatedRef;
use trellis_kube::Provider;

use crate::error::Result;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Attach an owner reference per owner resource to the created resource.
/// Owners without a uid (never persisted) are skipped.
pub async fn attach_owner_references(
    provider: &dyn Provider,
    created: &CreatedRef,
    owner_api_version: &str,
    owner_kind: &str,
    owners: &[Value],
) -> Result<()> {
    for attempt in 1..=MAX_ATTEMPTS {
        let mut current = provider
            .get_resource(&created.resource, &created.name, created.namespace.as_deref())
            .await?;
        let mut references = current["metadata"]["ownerReferences"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut added = false;
        for owner in owners {
            let Some(uid) = owner["metadata"]["uid"].as_str() else {
                continue;
            };
            if references.iter().any(|r| r["uid"].as_str() == Some(uid)) {
                continue;
            }
            references.push(json!({
                "apiVersion": owner_api_version,
                "kind": owner_kind,
                "name": owner["metadata"]["name"],
                "uid": uid,
            }));
            added = true;
        }
        if !added {
            return Ok(());
        }

        current["metadata"]["ownerReferences"] = Value::Array(references);
        match provider
            .update_resource(
                &created.resource,
                &created.name,
                created.namespace.as_deref(),
                current,
            )
            .await
        {
            Ok(_) => return Ok(()),
            Err(error) if error.is_conflict() && attempt < MAX_ATTEMPTS => {
                debug!(
                    resource = %created.resource,
                    name = %created.name,
                    attempt,
                    "owner reference update conflicted, retrying"
                );
                sleep(BACKOFF_STEP * attempt).await;
            }
            Err(error) => return Err(error.into()),
        }
    }
    Ok(())
}
