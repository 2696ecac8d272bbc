//! Error handling for the cluster cache.

use std::sync::Arc;

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors when syncing or querying the cluster cache.
#[derive(Debug, Error)]
pub enum Error {
    /// An error returned by the apiserver or the underlying client.
    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),

    /// The type fields of an object could not be parsed into a group/version.
    #[error(transparent)]
    ParseGroupVersion(#[from] kube::core::gvk::ParseGroupVersionError),

    /// A watch stream ended without being cancelled.
    ///
    /// The retry layer restarts the watch from the last seen resource version.
    #[error("watch stream closed unexpectedly")]
    WatchClosed,

    /// A list response carried no resource version to resume a watch from.
    #[error("list response for {0} had no resource version")]
    MissingResourceVersion(String),

    /// The object could not be converted to the requested API version.
    ///
    /// Callers fall back to refetching the object at the target version.
    #[error("cannot convert {kind} from {from} to {to}")]
    Conversion {
        /// Kind of the object that failed to convert.
        kind: String,
        /// API version the object currently has.
        from: String,
        /// API version that was requested.
        to: String,
    },

    /// A watch task panicked; recovered and retried like a transient failure.
    #[error("watcher panicked: {0}")]
    WatcherPanic(String),

    /// The last full sync failed with the wrapped error.
    ///
    /// Latched and returned from every [`ensure_synced`] call inside the
    /// failure retry window so that callers back off uniformly.
    ///
    /// [`ensure_synced`]: crate::ClusterCache::ensure_synced
    #[error("cluster sync failed: {0}")]
    Sync(#[source] Arc<Error>),
}

impl Error {
    fn status_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(resp)) => Some(resp.code),
            Error::Sync(inner) => inner.status_code(),
            _ => None,
        }
    }

    /// True if the remote reported the object or kind as absent (HTTP 404).
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// True if the remote reported the resource version as expired (HTTP 410).
    pub fn is_gone(&self) -> bool {
        self.status_code() == Some(410)
    }
}
