//! Live resource graph cache for declarative cluster controllers.
//!
//! [`ClusterCache`] keeps an in-memory mirror of every observable object in a
//! remote cluster. It discovers the kinds the apiserver serves, maintains one
//! resilient streaming watch per kind (resuming on expiry, restarting on
//! failure, following definitions as they are installed and removed), and
//! answers the queries a reconciliation engine needs: top-level resources per
//! namespace, owner-reference hierarchies with deterministic traversal, and
//! live counterparts of a controller's target objects.
//!
//! The cache is eventually consistent with the remote and holds nothing
//! across restarts. Remote access goes through the [`ClusterApi`] trait;
//! [`KubeClusterApi`] implements it over a [`kube::Client`], and tests can
//! substitute an in-memory fake.

pub mod api;
pub mod cluster;
mod error;
pub mod resource;
pub mod settings;
pub mod sync;
mod watch;

pub use api::{crd_group_kind, is_crd, ApiInfo, ClusterApi, DynClusterApi, KubeClusterApi};
pub use cluster::{ClusterCache, ClusterInfo, CLUSTER_RESYNC_TIMEOUT, CLUSTER_RETRY_TIMEOUT};
pub use error::{Error, Result};
pub use resource::{GroupKind, Resource, ResourceKey, ResourceMap, ResourceRef};
pub use settings::CacheOptions;
pub use watch::WATCH_RETRY_INTERVAL;
