//! Behavioural knobs and callbacks carried by a cache instance.

use std::{any::Any, sync::Arc, time::Duration};

use kube::api::{DynamicObject, WatchEvent};

use crate::{
    api::ApiInfo,
    resource::{Resource, ResourceMap},
};

/// Opaque per-node payload computed by the populate callback.
pub type ResourceInfo = Arc<dyn Any + Send + Sync>;

/// Computes the opaque `info` payload for a node and decides whether the full
/// object is retained in the cache. The second argument is true when the node
/// has no owners after synthetic-ownership corrections.
pub type PopulateResourceInfoHandler =
    Arc<dyn Fn(&DynamicObject, bool) -> (Option<ResourceInfo>, bool) + Send + Sync>;

/// Invoked with the raw watch event before the cache lock is taken.
///
/// Must not re-enter the cache.
pub type OnEventHandler = Arc<dyn Fn(&WatchEvent<DynamicObject>) + Send + Sync>;

/// Invoked under the cache lock after every effective index change.
///
/// The first argument is the new node (`None` for a deletion), the second the
/// replaced node (`None` for an insertion), the third the namespace bucket
/// after the change. Must not re-enter the cache.
pub type OnResourceUpdatedHandler =
    Arc<dyn Fn(Option<&Arc<Resource>>, Option<&Arc<Resource>>, &ResourceMap) + Send + Sync>;

/// Predicate applied to discovered kind descriptors.
pub type ResourceFilter = Arc<dyn Fn(&ApiInfo) -> bool + Send + Sync>;

/// Default bound on concurrently running initial lists during a sync.
pub const DEFAULT_LIST_PARALLELISM: usize = 50;

/// Options carried by a [`ClusterCache`](crate::ClusterCache).
///
/// Replaced atomically by [`invalidate_with`](crate::ClusterCache::invalidate_with).
#[derive(Clone, Default)]
pub struct CacheOptions {
    /// Namespaces to mirror. Empty watches the whole cluster; non-empty
    /// watches only the listed namespaces and skips cluster-scoped kinds.
    pub namespaces: Vec<String>,
    /// Keeps only matching kinds from discovery.
    pub resources_filter: Option<ResourceFilter>,
    /// Bound on concurrently running initial lists; 0 uses the default.
    pub list_parallelism: usize,
    /// Maximum lifetime of one watch session before the kind is relisted.
    pub watch_resync: Option<Duration>,
    /// Computes per-node info payloads and payload retention.
    pub populate_resource_info: Option<PopulateResourceInfoHandler>,
    /// Raw event callback, fired before dispatch.
    pub on_event: Option<OnEventHandler>,
    /// Index change callback, fired under the cache lock.
    pub on_resource_updated: Option<OnResourceUpdatedHandler>,
    /// Opaque hook consulted by external health assessors; never read here.
    pub resource_health_override: Option<Arc<dyn Any + Send + Sync>>,
}

impl CacheOptions {
    /// Options for watching the whole cluster with default tunables.
    pub fn new() -> Self {
        Self {
            list_parallelism: DEFAULT_LIST_PARALLELISM,
            ..Self::default()
        }
    }

    /// Restrict the cache to the given namespaces.
    pub fn with_namespaces(mut self, namespaces: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    /// Keep only kinds accepted by `filter`.
    pub fn with_resources_filter(
        mut self,
        filter: impl Fn(&ApiInfo) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.resources_filter = Some(Arc::new(filter));
        self
    }

    /// Bound the initial-list worker pool.
    pub fn with_list_parallelism(mut self, parallelism: usize) -> Self {
        self.list_parallelism = parallelism;
        self
    }

    /// Bound the lifetime of a single watch session.
    pub fn with_watch_resync(mut self, interval: Duration) -> Self {
        self.watch_resync = Some(interval);
        self
    }

    /// Install the populate callback.
    pub fn with_populate_resource_info(
        mut self,
        populate: impl Fn(&DynamicObject, bool) -> (Option<ResourceInfo>, bool) + Send + Sync + 'static,
    ) -> Self {
        self.populate_resource_info = Some(Arc::new(populate));
        self
    }

    /// Install the raw event callback.
    pub fn with_on_event(
        mut self,
        handler: impl Fn(&WatchEvent<DynamicObject>) + Send + Sync + 'static,
    ) -> Self {
        self.on_event = Some(Arc::new(handler));
        self
    }

    /// Install the index change callback.
    pub fn with_on_resource_updated(
        mut self,
        handler: impl Fn(Option<&Arc<Resource>>, Option<&Arc<Resource>>, &ResourceMap) + Send + Sync + 'static,
    ) -> Self {
        self.on_resource_updated = Some(Arc::new(handler));
        self
    }

    /// Attach the opaque health override handle.
    pub fn with_resource_health_override(mut self, hook: Arc<dyn Any + Send + Sync>) -> Self {
        self.resource_health_override = Some(hook);
        self
    }

    pub(crate) fn effective_list_parallelism(&self) -> usize {
        if self.list_parallelism == 0 {
            DEFAULT_LIST_PARALLELISM
        } else {
            self.list_parallelism
        }
    }
}
