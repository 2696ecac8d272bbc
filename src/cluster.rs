//! The shared indexed store: sync lifecycle, event dispatch and queries.

use std::{any::Any, str::FromStr, sync::Arc, time::Duration};

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use kube::{
    api::{DynamicObject, GroupVersionKind, WatchEvent},
    core::gvk::GroupVersion,
};
use parking_lot::RwLock;
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::{ApiInfo, DynClusterApi},
    error::{Error, Result},
    resource::{owner_refs_with_synthetics, GroupKind, Resource, ResourceKey, ResourceMap, ResourceRef},
    settings::CacheOptions,
    watch,
};

/// How long a successful sync stays fresh before the next
/// [`ensure_synced`](ClusterCache::ensure_synced) resyncs.
pub const CLUSTER_RESYNC_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// How long a failed sync is latched before another attempt is made.
pub const CLUSTER_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Point-in-time summary of the cache.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// Identity of the remote, as reported by the API layer.
    pub server: String,
    /// Remote version string captured at the last successful sync.
    pub server_version: String,
    /// Number of kinds with a live watch.
    pub apis_count: usize,
    /// Number of cached resources.
    pub resources_count: usize,
    /// Wall-clock time of the last sync attempt.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Error latched by the last sync attempt, if it failed.
    pub sync_error: Option<Arc<Error>>,
}

/// Per-kind bookkeeping, present exactly while the kind is watched.
pub(crate) struct ApiMeta {
    pub(crate) info: ApiInfo,
    pub(crate) watch_cancel: CancellationToken,
    /// Last resource version seen for this kind; empty forces a relist.
    pub(crate) resource_version: String,
}

/// Everything guarded by the cache-wide lock.
pub(crate) struct CacheState {
    pub(crate) api: DynClusterApi,
    pub(crate) options: CacheOptions,
    pub(crate) resources: ResourceMap,
    pub(crate) ns_index: AHashMap<String, ResourceMap>,
    pub(crate) apis: AHashMap<GroupKind, ApiMeta>,
    sync_time: Option<Instant>,
    last_sync_time: Option<DateTime<Utc>>,
    sync_error: Option<Arc<Error>>,
}

impl CacheState {
    fn new(api: DynClusterApi, options: CacheOptions) -> Self {
        Self {
            api,
            options,
            resources: ResourceMap::default(),
            ns_index: AHashMap::new(),
            apis: AHashMap::new(),
            sync_time: None,
            last_sync_time: None,
            sync_error: None,
        }
    }

    fn synced(&self) -> bool {
        let Some(at) = self.sync_time else { return false };
        let window = if self.sync_error.is_some() {
            CLUSTER_RETRY_TIMEOUT
        } else {
            CLUSTER_RESYNC_TIMEOUT
        };
        at.elapsed() < window
    }

    fn sync_result(&self) -> Result<()> {
        match &self.sync_error {
            Some(err) => Err(Error::Sync(err.clone())),
            None => Ok(()),
        }
    }

    /// Build a node from a raw object, applying synthetic-ownership
    /// corrections and the populate callback.
    pub(crate) fn new_resource(&self, obj: &DynamicObject) -> Arc<Resource> {
        let owner_refs = owner_refs_with_synthetics(obj);
        let is_root = owner_refs.is_empty();
        let (info, cache_manifest) = match &self.options.populate_resource_info {
            Some(populate) => populate(obj, is_root),
            None => (None, false),
        };
        Arc::new(Resource {
            object_ref: ResourceRef::from_object(obj),
            resource_version: obj.metadata.resource_version.clone().unwrap_or_default(),
            owner_refs,
            info,
            resource: cache_manifest.then(|| obj.clone()),
        })
    }

    pub(crate) fn set_node(&mut self, node: Arc<Resource>) {
        let key = node.key();
        let old = self.resources.insert(key.clone(), node.clone());
        let bucket = self.ns_index.entry(key.namespace.clone()).or_default();
        bucket.insert(key, node.clone());
        if let Some(handler) = self.options.on_resource_updated.clone() {
            handler(Some(&node), old.as_ref(), bucket);
        }
    }

    pub(crate) fn remove_node(&mut self, key: &ResourceKey) {
        let Some(old) = self.resources.remove(key) else { return };
        if let Some(bucket) = self.ns_index.get_mut(&key.namespace) {
            bucket.remove(key);
            if let Some(handler) = self.options.on_resource_updated.clone() {
                handler(None, Some(&old), bucket);
            }
            if bucket.is_empty() {
                self.ns_index.remove(&key.namespace);
            }
        }
    }

    /// Apply one streamed event to the indices.
    pub(crate) fn apply_watch_event(&mut self, event: &WatchEvent<DynamicObject>) {
        match event {
            WatchEvent::Deleted(obj) => self.remove_node(&ResourceKey::from_object(obj)),
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let node = self.new_resource(obj);
                self.set_node(node);
            }
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => {}
        }
    }

    /// Replace this kind's slice of the cache with a fresh list result.
    ///
    /// When `namespace` is given the deletion-reconciliation pass is limited
    /// to that namespace, so lists scoped to one namespace do not evict
    /// objects seen by the other scopes.
    pub(crate) fn replace_kind(
        &mut self,
        gk: &GroupKind,
        namespace: Option<&str>,
        items: Vec<DynamicObject>,
    ) {
        let mut listed = AHashSet::with_capacity(items.len());
        for obj in &items {
            let node = self.new_resource(obj);
            listed.insert(node.key());
            self.set_node(node);
        }
        let stale: Vec<ResourceKey> = self
            .resources
            .keys()
            .filter(|key| {
                key.group == gk.group
                    && key.kind == gk.kind
                    && namespace.is_none_or(|ns| key.namespace == ns)
                    && !listed.contains(*key)
            })
            .cloned()
            .collect();
        for key in stale {
            self.remove_node(&key);
        }
    }

    pub(crate) fn record_resource_version(&mut self, gk: &GroupKind, resource_version: &str) {
        if let Some(meta) = self.apis.get_mut(gk) {
            meta.resource_version = resource_version.to_string();
        }
    }

    pub(crate) fn resource_version_of(&self, gk: &GroupKind) -> Option<String> {
        self.apis.get(gk).map(|meta| meta.resource_version.clone())
    }

    /// Cancel every watch and empty the API table.
    pub(crate) fn invalidate_watches(&mut self) {
        for (_, meta) in self.apis.drain() {
            meta.watch_cancel.cancel();
        }
    }

    /// Drop every cached object of a kind, notifying the update callback.
    pub(crate) fn drop_kind(&mut self, gk: &GroupKind) {
        let keys: Vec<ResourceKey> = self
            .resources
            .keys()
            .filter(|key| key.group == gk.group && key.kind == gk.kind)
            .cloned()
            .collect();
        for key in keys {
            self.remove_node(&key);
        }
    }
}

pub(crate) struct CacheInner {
    pub(crate) state: Mutex<CacheState>,
    server_version: RwLock<String>,
}

impl CacheInner {
    /// Full resync: tear down watches, relist everything, restart watches.
    ///
    /// Runs with the cache-wide lock held by the caller; listing fans out over
    /// a bounded worker pool while index writes stay serialized on this task.
    /// Returns the probed server version, which the caller publishes only
    /// once the whole sync has succeeded.
    async fn sync(self: &Arc<Self>, state: &mut CacheState) -> Result<String> {
        info!(server = %state.api.server_url(), "start syncing cluster");
        state.invalidate_watches();
        state.resources.clear();
        state.ns_index.clear();

        let api = state.api.clone();
        let version = api.server_version().await?;

        let mut kinds = api.discover().await?;
        if let Some(filter) = state.options.resources_filter.clone() {
            kinds.retain(|info| filter(info));
        }

        let mut targets = Vec::new();
        for info in kinds {
            if state.options.namespaces.is_empty() {
                targets.push((info, None));
            } else if info.namespaced {
                for ns in &state.options.namespaces {
                    targets.push((info.clone(), Some(ns.clone())));
                }
            }
        }

        let mut lists = stream::iter(targets.into_iter().map(|(info, ns)| {
            let api = api.clone();
            async move {
                let list = api.list(&info.resource, ns.as_deref()).await;
                (info, ns, list)
            }
        }))
        .buffer_unordered(state.options.effective_list_parallelism());

        let mut pending: AHashMap<GroupKind, (ApiInfo, Vec<Option<String>>, String)> =
            AHashMap::new();
        while let Some((info, ns, list)) = lists.next().await {
            let list = list?;
            let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
            if resource_version.is_empty() {
                return Err(Error::MissingResourceVersion(info.group_kind().to_string()));
            }
            for obj in &list.items {
                let node = state.new_resource(obj);
                state.set_node(node);
            }
            let entry = pending
                .entry(info.group_kind())
                .or_insert_with(|| (info, Vec::new(), String::new()));
            entry.1.push(ns);
            entry.2 = resource_version;
        }
        drop(lists);

        for (_, (info, namespaces, resource_version)) in pending {
            self.start_kind_watch(state, info, namespaces, resource_version);
        }
        info!(
            resources = state.resources.len(),
            apis = state.apis.len(),
            "cluster synced"
        );
        Ok(version)
    }

    /// Register the kind in the API table and spawn one watch task per scope.
    fn start_kind_watch(
        self: &Arc<Self>,
        state: &mut CacheState,
        info: ApiInfo,
        namespaces: Vec<Option<String>>,
        resource_version: String,
    ) {
        let gk = info.group_kind();
        let token = CancellationToken::new();
        state.apis.insert(
            gk.clone(),
            ApiMeta {
                info: info.clone(),
                watch_cancel: token.clone(),
                resource_version,
            },
        );
        debug!(kind = %gk, scopes = namespaces.len(), "start watching kind");
        for ns in namespaces {
            watch::spawn_kind_watch(self.clone(), info.clone(), ns, token.clone());
        }
    }

    /// Stop watching a kind and drop its objects. Used when the remote stops
    /// serving the kind (watch-open 404 or CRD deletion).
    pub(crate) async fn stop_watching(&self, gk: &GroupKind) {
        let mut state = self.state.lock().await;
        if let Some(meta) = state.apis.remove(gk) {
            meta.watch_cancel.cancel();
            state.drop_kind(gk);
            info!(kind = %gk, "stopped watching kind");
        }
    }

    /// Discover kinds that appeared since the last sync and start watching
    /// them. Triggered by CRD add/modify events.
    pub(crate) async fn discover_missing_kinds(self: &Arc<Self>) -> Result<()> {
        let (api, filter, namespaces) = {
            let state = self.state.lock().await;
            (
                state.api.clone(),
                state.options.resources_filter.clone(),
                state.options.namespaces.clone(),
            )
        };
        let mut kinds = api.discover().await?;
        if let Some(filter) = filter {
            kinds.retain(|info| filter(info));
        }

        let mut state = self.state.lock().await;
        for info in kinds {
            if state.apis.contains_key(&info.group_kind()) {
                continue;
            }
            // an empty resource version makes the new watch relist first
            if namespaces.is_empty() {
                self.start_kind_watch(&mut state, info, vec![None], String::new());
            } else if info.namespaced {
                let scopes = namespaces.iter().map(|ns| Some(ns.clone())).collect();
                self.start_kind_watch(&mut state, info, scopes, String::new());
            }
        }
        Ok(())
    }
}

/// Live mirror of the observable objects in one remote cluster.
///
/// The cache discovers the kinds the remote serves, keeps one streaming watch
/// per kind, and answers hierarchy and snapshot queries from two always-
/// coherent indices (by key and by namespace). It is eventually consistent
/// with the remote and holds no state across restarts.
///
/// Cloning is cheap and shares the underlying cache.
///
/// ```no_run
/// use std::sync::Arc;
/// use cluster_cache::{CacheOptions, ClusterCache, KubeClusterApi};
///
/// async fn run(client: kube::Client) -> Result<(), cluster_cache::Error> {
///     let api = Arc::new(KubeClusterApi::new(client, "https://10.96.0.1"));
///     let cache = ClusterCache::new(api, CacheOptions::new());
///     cache.ensure_synced().await?;
///     let roots = cache.namespace_top_level_resources("default").await;
///     println!("{} top-level resources", roots.len());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ClusterCache {
    inner: Arc<CacheInner>,
}

impl ClusterCache {
    /// Create an unsynced cache over the given remote.
    pub fn new(api: DynClusterApi, options: CacheOptions) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::new(api, options)),
                server_version: RwLock::new(String::new()),
            }),
        }
    }

    /// Sync the cache if it is not fresh.
    ///
    /// A successful sync stays fresh for [`CLUSTER_RESYNC_TIMEOUT`]; a failed
    /// one for [`CLUSTER_RETRY_TIMEOUT`], during which the latched error is
    /// returned without touching the remote. The cache-wide lock is held for
    /// the whole resync, serializing concurrent callers.
    pub async fn ensure_synced(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.synced() {
            return state.sync_result();
        }
        let result = self.inner.sync(&mut state).await;
        state.sync_time = Some(Instant::now());
        state.last_sync_time = Some(Utc::now());
        match result {
            Ok(version) => {
                *self.inner.server_version.write() = version;
                state.sync_error = None;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "cluster sync failed");
                let err = Arc::new(err);
                state.sync_error = Some(err.clone());
                Err(Error::Sync(err))
            }
        }
    }

    /// Mark the cache unsynced and cancel every watch.
    ///
    /// Watchers observe the cancellation at their next suspension point; the
    /// next [`ensure_synced`](Self::ensure_synced) starts from scratch.
    pub async fn invalidate(&self) {
        self.invalidate_with(|api, options| (api, options)).await;
    }

    /// [`invalidate`](Self::invalidate), atomically replacing the connection
    /// and options used by subsequent syncs.
    pub async fn invalidate_with<F>(&self, update: F)
    where
        F: FnOnce(DynClusterApi, CacheOptions) -> (DynClusterApi, CacheOptions) + Send,
    {
        let mut state = self.inner.state.lock().await;
        state.sync_time = None;
        state.invalidate_watches();
        let api = state.api.clone();
        let options = std::mem::take(&mut state.options);
        let (api, options) = update(api, options);
        state.api = api;
        state.options = options;
        info!("invalidated cluster cache");
    }

    /// Remote version string captured at the last successful sync.
    pub fn server_version(&self) -> String {
        self.inner.server_version.read().clone()
    }

    /// Whether instances of a kind live inside a namespace.
    ///
    /// Unknown kinds report `true`: namespaced is the safe over-approximation
    /// for managed-object reconciliation.
    pub async fn is_namespaced(&self, gk: &GroupKind) -> bool {
        let state = self.inner.state.lock().await;
        state.apis.get(gk).map_or(true, |meta| meta.info.namespaced)
    }

    /// Snapshot of every cached resource in `namespace` without owners.
    pub async fn namespace_top_level_resources(&self, namespace: &str) -> ResourceMap {
        self.find_resources(namespace, |node| node.is_top_level()).await
    }

    /// Snapshot of cached resources matching `predicate`; an empty namespace
    /// searches the whole cache.
    pub async fn find_resources<F>(&self, namespace: &str, predicate: F) -> ResourceMap
    where
        F: Fn(&Resource) -> bool,
    {
        let state = self.inner.state.lock().await;
        let matching = |map: &ResourceMap| {
            map.iter()
                .filter(|(_, node)| predicate(node))
                .map(|(key, node)| (key.clone(), node.clone()))
                .collect()
        };
        if namespace.is_empty() {
            matching(&state.resources)
        } else {
            state.ns_index.get(namespace).map(matching).unwrap_or_default()
        }
    }

    /// Walk the ownership tree rooted at `key`, depth first, within the
    /// root's namespace.
    ///
    /// `action` receives each visited node together with the namespace bucket
    /// and runs under the cache lock: it must not re-enter the cache. Nodes
    /// with the same uid are deduplicated to the representative whose key
    /// sorts first, and owner cycles are broken by a visited set, so repeated
    /// walks over an unchanged cache visit the same nodes in the same order.
    pub async fn iterate_hierarchy<F>(&self, key: &ResourceKey, mut action: F)
    where
        F: FnMut(&Arc<Resource>, &ResourceMap),
    {
        let state = self.inner.state.lock().await;
        let Some(root) = state.resources.get(key) else { return };
        let Some(bucket) = state.ns_index.get(&key.namespace) else { return };
        action(root, bucket);
        let mut visited = AHashSet::new();
        visited.insert(key.clone());
        iterate_children(bucket, root, &mut visited, &mut action);
    }

    /// Resolve the live counterparts of a controller's target objects.
    ///
    /// Seeds the result with every owner-less managed node whose payload is
    /// retained, then fills per-target gaps from the cache or the remote and
    /// converts candidates to each target's API version (refetching at the
    /// target version when conversion fails). Objects absent on the remote
    /// are silently left out. The cache lock is held only while planning from
    /// the indices; the remote round-trips run with it released.
    pub async fn managed_live_objects<F>(
        &self,
        target_objs: &[DynamicObject],
        is_managed: F,
    ) -> Result<AHashMap<ResourceKey, DynamicObject>>
    where
        F: Fn(&Resource) -> bool,
    {
        struct Job {
            key: ResourceKey,
            gvk: GroupVersionKind,
            target_api_version: String,
            namespace: Option<String>,
            name: String,
            candidate: Option<DynamicObject>,
        }

        let (api, parallelism, mut managed, jobs) = {
            let state = self.inner.state.lock().await;

            let mut managed: AHashMap<ResourceKey, DynamicObject> = AHashMap::new();
            for (key, node) in &state.resources {
                if node.is_top_level() && is_managed(node) {
                    if let Some(obj) = &node.resource {
                        managed.insert(key.clone(), obj.clone());
                    }
                }
            }

            let mut jobs = Vec::new();
            for target in target_objs {
                let key = ResourceKey::from_object(target);
                let target_api_version = target
                    .types
                    .as_ref()
                    .map(|tm| tm.api_version.clone())
                    .unwrap_or_default();
                let gvk = GroupVersion::from_str(&target_api_version)?.with_kind(&key.kind);

                if let Some(seeded) = managed.get(&key) {
                    jobs.push(Job {
                        gvk,
                        target_api_version,
                        namespace: none_if_empty(&key.namespace),
                        name: key.name.clone(),
                        candidate: Some(seeded.clone()),
                        key,
                    });
                } else if let Some(node) = state.resources.get(&key) {
                    // cached without payload: fetch live at the target version
                    jobs.push(Job {
                        gvk,
                        target_api_version,
                        namespace: none_if_empty(&node.object_ref.namespace),
                        name: node.object_ref.name.clone(),
                        candidate: node.resource.clone(),
                        key,
                    });
                } else if !state.apis.contains_key(&key.group_kind()) {
                    jobs.push(Job {
                        gvk,
                        target_api_version,
                        namespace: target.metadata.namespace.clone(),
                        name: target.metadata.name.clone().unwrap_or_default(),
                        candidate: None,
                        key,
                    });
                }
                // watched and absent: known not to exist, leave out
            }

            (
                state.api.clone(),
                state.options.effective_list_parallelism(),
                managed,
                jobs,
            )
        };

        let results: Vec<Result<(ResourceKey, Option<DynamicObject>)>> =
            stream::iter(jobs.into_iter().map(|job| {
                let api = api.clone();
                async move {
                    let candidate = match job.candidate {
                        Some(obj) => obj,
                        None => match api.get(&job.gvk, job.namespace.as_deref(), &job.name).await {
                            Ok(obj) => obj,
                            Err(err) if err.is_not_found() => return Ok((job.key, None)),
                            Err(err) => return Err(err),
                        },
                    };
                    let converted = match api.convert(&candidate, &job.target_api_version).await {
                        Ok(obj) => Some(obj),
                        Err(err) => {
                            debug!(key = %job.key, error = %err, "conversion failed, refetching at target version");
                            match api.get(&job.gvk, job.namespace.as_deref(), &job.name).await {
                                Ok(obj) => Some(obj),
                                Err(err) if err.is_not_found() => None,
                                Err(err) => return Err(err),
                            }
                        }
                    };
                    Ok((job.key, converted))
                }
            }))
            .buffer_unordered(parallelism)
            .collect()
            .await;

        for result in results {
            let (key, obj) = result?;
            match obj {
                Some(obj) => {
                    managed.insert(key, obj);
                }
                // absent on the remote: not an error, but not a live object either
                None => {
                    managed.remove(&key);
                }
            }
        }
        Ok(managed)
    }

    /// Snapshot of the kind descriptors currently being watched.
    pub async fn api_resources(&self) -> Vec<ApiInfo> {
        let state = self.inner.state.lock().await;
        state.apis.values().map(|meta| meta.info.clone()).collect()
    }

    /// Snapshot of counts, identity and sync status.
    pub async fn cluster_info(&self) -> ClusterInfo {
        let state = self.inner.state.lock().await;
        ClusterInfo {
            server: state.api.server_url(),
            server_version: self.inner.server_version.read().clone(),
            apis_count: state.apis.len(),
            resources_count: state.resources.len(),
            last_sync_time: state.last_sync_time,
            sync_error: state.sync_error.clone(),
        }
    }

    /// The opaque health override handle carried in the options.
    pub async fn resource_health_override(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        let state = self.inner.state.lock().await;
        state.options.resource_health_override.clone()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Mutex<CacheState> {
        &self.inner.state
    }
}

fn none_if_empty(namespace: &str) -> Option<String> {
    if namespace.is_empty() {
        None
    } else {
        Some(namespace.to_string())
    }
}

fn iterate_children<F>(
    bucket: &ResourceMap,
    parent: &Arc<Resource>,
    visited: &mut AHashSet<ResourceKey>,
    action: &mut F,
) where
    F: FnMut(&Arc<Resource>, &ResourceMap),
{
    let mut by_uid: AHashMap<String, Vec<&Arc<Resource>>> = AHashMap::new();
    for child in bucket.values() {
        if parent.is_parent_of(child) && !visited.contains(&child.key()) {
            let uid = &child.object_ref.uid;
            // objects without a uid are never duplicates of each other
            let group = if uid.is_empty() { child.key().to_string() } else { uid.clone() };
            by_uid.entry(group).or_default().push(child);
        }
    }
    let mut chosen: Vec<&Arc<Resource>> = by_uid
        .into_iter()
        .map(|(_, mut dups)| {
            // the same logical object may be served under several API groups;
            // pick the same representative on every walk
            dups.sort_by_key(|node| node.key());
            dups[0]
        })
        .collect();
    chosen.sort_by_key(|node| node.key());
    for child in chosen {
        if !visited.insert(child.key()) {
            continue;
        }
        action(child, bucket);
        iterate_children(bucket, child, visited, action);
    }
}
