//! Per-kind watch loops and their retry layer.

use std::{any::Any, sync::Arc, time::Duration};

use futures::{FutureExt, StreamExt};
use kube::api::{DynamicObject, WatchEvent};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::{crd_group_kind, is_crd, ApiInfo},
    cluster::CacheInner,
    error::{Error, Result},
    resource::GroupKind,
};

/// Fixed interval between retries of a failed watch.
pub const WATCH_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the long-lived watch task for one kind within one scope.
pub(crate) fn spawn_kind_watch(
    inner: Arc<CacheInner>,
    info: ApiInfo,
    namespace: Option<String>,
    token: CancellationToken,
) {
    tokio::spawn(watch_kind(inner, info, namespace, token));
}

/// Drive one kind's watch until cancelled or the kind disappears, retrying
/// failed sessions at a fixed interval.
///
/// A panic inside a session is contained here and retried like a transient
/// failure, so one misbehaving kind cannot take down its siblings.
async fn watch_kind(
    inner: Arc<CacheInner>,
    info: ApiInfo,
    namespace: Option<String>,
    token: CancellationToken,
) {
    let gk = info.group_kind();
    loop {
        let session =
            std::panic::AssertUnwindSafe(watch_session(&inner, &info, namespace.as_deref(), &token))
                .catch_unwind();
        let outcome = tokio::select! {
            () = token.cancelled() => {
                debug!(kind = %gk, "watch cancelled");
                return;
            }
            outcome = session => outcome,
        };
        // a cancelled watcher must not touch state that now belongs to a
        // successor watching the same kind
        if token.is_cancelled() {
            return;
        }
        let err = match outcome {
            // the kind is no longer tracked in the API table
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(panic) => Error::WatcherPanic(panic_message(panic)),
        };
        if err.is_not_found() {
            info!(kind = %gk, "kind no longer served, stopping watch");
            inner.stop_watching(&gk).await;
            return;
        }
        warn!(kind = %gk, error = %err, "watch failed, retrying");
        tokio::select! {
            () = token.cancelled() => return,
            () = sleep(WATCH_RETRY_INTERVAL) => {}
        }
    }
}

/// One list+watch session.
///
/// Relists when the recorded resource version is empty (or expires with HTTP
/// 410, observed either at watch-open or as a streamed error), then applies
/// streamed events one index mutation per lock acquisition. Returns `Ok` only
/// when the kind has been dropped from the API table.
async fn watch_session(
    inner: &Arc<CacheInner>,
    info: &ApiInfo,
    namespace: Option<&str>,
    token: &CancellationToken,
) -> Result<()> {
    let gk = info.group_kind();
    'relist: loop {
        let (api, mut resource_version, resync, on_event) = {
            let state = inner.state.lock().await;
            if token.is_cancelled() {
                return Ok(());
            }
            let Some(resource_version) = state.resource_version_of(&gk) else {
                return Ok(());
            };
            (
                state.api.clone(),
                resource_version,
                state.options.watch_resync,
                state.options.on_event.clone(),
            )
        };

        if resource_version.is_empty() {
            let list = api.list(&info.resource, namespace).await?;
            resource_version = list.metadata.resource_version.clone().unwrap_or_default();
            if resource_version.is_empty() {
                return Err(Error::MissingResourceVersion(gk.to_string()));
            }
            let mut state = inner.state.lock().await;
            if token.is_cancelled() {
                return Ok(());
            }
            state.replace_kind(&gk, namespace, list.items);
            state.record_resource_version(&gk, &resource_version);
        }

        let mut stream = match api.watch(&info.resource, namespace, &resource_version).await {
            Ok(stream) => stream,
            Err(err) if err.is_gone() => {
                debug!(kind = %gk, "resource version expired, relisting");
                clear_resource_version(inner, &gk, token).await;
                continue 'relist;
            }
            Err(err) => return Err(err),
        };

        let deadline = resync.map(|interval| Instant::now() + interval);
        loop {
            let event = match deadline {
                Some(deadline) => tokio::select! {
                    () = sleep_until(deadline) => {
                        debug!(kind = %gk, "watch session expired, relisting");
                        clear_resource_version(inner, &gk, token).await;
                        continue 'relist;
                    }
                    event = stream.next() => event,
                },
                None => stream.next().await,
            };
            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(Error::WatchClosed),
            };
            match &event {
                WatchEvent::Bookmark(bookmark) => {
                    let mut state = inner.state.lock().await;
                    if token.is_cancelled() {
                        return Ok(());
                    }
                    state.record_resource_version(&gk, &bookmark.metadata.resource_version);
                }
                WatchEvent::Error(status) => {
                    if status.code == 410 {
                        debug!(kind = %gk, "watch expired mid-stream, relisting");
                        clear_resource_version(inner, &gk, token).await;
                        continue 'relist;
                    }
                    return Err(Error::Kube(kube::Error::Api(status.clone())));
                }
                WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                    if let Some(handler) = &on_event {
                        handler(&event);
                    }
                    let resource_version = obj.metadata.resource_version.clone().unwrap_or_default();
                    {
                        let mut state = inner.state.lock().await;
                        if token.is_cancelled() {
                            return Ok(());
                        }
                        state.record_resource_version(&gk, &resource_version);
                        state.apply_watch_event(&event);
                    }
                    if is_crd(obj) {
                        handle_crd_event(inner, &event, obj).await;
                    }
                }
            }
        }
    }
}

/// Empty out the recorded resource version so the next session relists.
async fn clear_resource_version(
    inner: &Arc<CacheInner>,
    gk: &GroupKind,
    token: &CancellationToken,
) {
    let mut state = inner.state.lock().await;
    if !token.is_cancelled() {
        state.record_resource_version(gk, "");
    }
}

/// Kinds come and go with their definitions: adding or updating a definition
/// may expose kinds nobody watches yet, deleting one retires its kind.
async fn handle_crd_event(
    inner: &Arc<CacheInner>,
    event: &WatchEvent<DynamicObject>,
    obj: &DynamicObject,
) {
    if matches!(event, WatchEvent::Deleted(_)) {
        if let Some(gk) = crd_group_kind(obj) {
            inner.stop_watching(&gk).await;
        }
    } else if let Err(err) = inner.discover_missing_kinds().await {
        warn!(error = %err, "failed to discover new kinds after definition change");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
