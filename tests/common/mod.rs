//! In-memory cluster fake driving the cache through its `ClusterApi` seam.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use cluster_cache::{ApiInfo, ClusterApi, Error, GroupKind, ResourceKey, Result};
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ListMeta, OwnerReference};
use kube::{
    api::{ApiResource, DynamicObject, GroupVersionKind, ObjectList, TypeMeta, WatchEvent},
    core::ErrorResponse,
};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedSender};

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} from mock"),
        reason: reason.to_string(),
        code,
    })
}

pub fn pod(namespace: &str, name: &str, uid: &str) -> DynamicObject {
    object("v1", "Pod", namespace, name, uid)
}

pub fn object(api_version: &str, kind: &str, namespace: &str, name: &str, uid: &str) -> DynamicObject {
    let mut obj = DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata: Default::default(),
        data: json!({}),
    };
    obj.metadata.name = Some(name.to_string());
    if !namespace.is_empty() {
        obj.metadata.namespace = Some(namespace.to_string());
    }
    obj.metadata.uid = Some(uid.to_string());
    obj
}

pub fn owned_by(mut obj: DynamicObject, api_version: &str, kind: &str, name: &str, uid: &str) -> DynamicObject {
    obj.metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            ..OwnerReference::default()
        });
    obj
}

/// A definition object whose dispatch makes the cache (un)track `group/kind`.
pub fn crd(group: &str, kind: &str) -> DynamicObject {
    let plural = format!("{}s", kind.to_lowercase());
    let mut obj = DynamicObject {
        types: Some(TypeMeta {
            api_version: "apiextensions.k8s.io/v1".to_string(),
            kind: "CustomResourceDefinition".to_string(),
        }),
        metadata: Default::default(),
        data: json!({
            "spec": {
                "group": group,
                "names": {"kind": kind, "plural": plural},
            }
        }),
    };
    obj.metadata.name = Some(format!("{plural}.{group}"));
    obj
}

struct Watcher {
    gk: GroupKind,
    namespace: Option<String>,
    tx: UnboundedSender<kube::Result<WatchEvent<DynamicObject>>>,
}

#[derive(Default)]
struct MockState {
    version: String,
    kinds: Vec<ApiInfo>,
    objects: HashMap<GroupKind, HashMap<ResourceKey, DynamicObject>>,
    watchers: Vec<Watcher>,
    resource_version: u64,
    gone_kinds: HashSet<GroupKind>,
    fail_discover: bool,
    fail_conversion: bool,
    discover_calls: u64,
    list_calls: u64,
    get_calls: u64,
}

/// Shared in-memory cluster; every mutator broadcasts watch events the way an
/// apiserver would.
pub struct MockCluster {
    state: Mutex<MockState>,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                version: "v1.30.0".to_string(),
                resource_version: 1,
                ..MockState::default()
            }),
        })
    }

    pub fn add_kind(&self, group: &str, version: &str, kind: &str, namespaced: bool) {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let plural = format!("{}s", kind.to_lowercase());
        let resource = ApiResource::from_gvk_with_plural(&gvk, &plural);
        let mut state = self.state.lock().unwrap();
        state.kinds.push(ApiInfo { resource, namespaced });
        state.objects.entry(GroupKind::new(group, kind)).or_default();
    }

    pub fn remove_kind(&self, group: &str, kind: &str) {
        let gk = GroupKind::new(group, kind);
        let mut state = self.state.lock().unwrap();
        state.kinds.retain(|info| info.group_kind() != gk);
    }

    /// Insert or update an object and broadcast the change.
    pub fn put(&self, mut obj: DynamicObject) -> String {
        let mut state = self.state.lock().unwrap();
        let rv = state.next_resource_version();
        obj.metadata.resource_version = Some(rv.clone());
        let key = ResourceKey::from_object(&obj);
        let gk = key.group_kind();
        let previous = state.objects.entry(gk.clone()).or_default().insert(key, obj.clone());
        let event = if previous.is_some() {
            WatchEvent::Modified(obj)
        } else {
            WatchEvent::Added(obj)
        };
        state.broadcast(&gk, event);
        rv
    }

    /// Remove an object and broadcast the deletion.
    pub fn delete(&self, key: &ResourceKey) {
        let mut state = self.state.lock().unwrap();
        let gk = key.group_kind();
        let Some(mut obj) = state.objects.get_mut(&gk).and_then(|objs| objs.remove(key)) else {
            return;
        };
        let rv = state.next_resource_version();
        obj.metadata.resource_version = Some(rv);
        state.broadcast(&gk, WatchEvent::Deleted(obj));
    }

    /// Insert without broadcasting, as if the change was missed by the watch.
    pub fn insert_quiet(&self, mut obj: DynamicObject) {
        let mut state = self.state.lock().unwrap();
        let rv = state.next_resource_version();
        obj.metadata.resource_version = Some(rv);
        let key = ResourceKey::from_object(&obj);
        state.objects.entry(key.group_kind()).or_default().insert(key, obj);
    }

    /// Remove without broadcasting.
    pub fn remove_quiet(&self, key: &ResourceKey) {
        let mut state = self.state.lock().unwrap();
        if let Some(objs) = state.objects.get_mut(&key.group_kind()) {
            objs.remove(key);
        }
    }

    /// Push an expiry error onto the kind's streams, as the apiserver does
    /// when a watch falls out of its history window.
    pub fn expire_watch(&self, group: &str, kind: &str) {
        let gk = GroupKind::new(group, kind);
        let state = self.state.lock().unwrap();
        for watcher in state.watchers.iter().filter(|w| w.gk == gk) {
            let _ = watcher.tx.send(Ok(WatchEvent::Error(ErrorResponse {
                status: "Failure".to_string(),
                message: "too old resource version".to_string(),
                reason: "Expired".to_string(),
                code: 410,
            })));
        }
    }

    /// Close the kind's streams without an error, like a dropped connection.
    pub fn close_watch(&self, group: &str, kind: &str) {
        let gk = GroupKind::new(group, kind);
        let mut state = self.state.lock().unwrap();
        state.watchers.retain(|w| w.gk != gk);
    }

    /// Fail the next watch-open for the kind with HTTP 410.
    pub fn expire_next_watch_open(&self, group: &str, kind: &str) {
        let mut state = self.state.lock().unwrap();
        state.gone_kinds.insert(GroupKind::new(group, kind));
    }

    pub fn set_fail_discover(&self, fail: bool) {
        self.state.lock().unwrap().fail_discover = fail;
    }

    pub fn set_fail_conversion(&self, fail: bool) {
        self.state.lock().unwrap().fail_conversion = fail;
    }

    pub fn discover_calls(&self) -> u64 {
        self.state.lock().unwrap().discover_calls
    }

    pub fn list_calls(&self) -> u64 {
        self.state.lock().unwrap().list_calls
    }

    pub fn get_calls(&self) -> u64 {
        self.state.lock().unwrap().get_calls
    }

    pub fn watcher_count(&self, group: &str, kind: &str) -> usize {
        let gk = GroupKind::new(group, kind);
        self.state.lock().unwrap().watchers.iter().filter(|w| w.gk == gk).count()
    }
}

impl MockState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn broadcast(&mut self, gk: &GroupKind, event: WatchEvent<DynamicObject>) {
        let namespace = match &event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                obj.metadata.namespace.clone()
            }
            _ => None,
        };
        self.watchers.retain(|watcher| {
            if watcher.gk != *gk {
                return !watcher.tx.is_closed();
            }
            let in_scope = match (&watcher.namespace, &namespace) {
                (Some(watched), Some(actual)) => watched == actual,
                (Some(_), None) => false,
                (None, _) => true,
            };
            if in_scope {
                watcher.tx.send(Ok(event.clone())).is_ok()
            } else {
                !watcher.tx.is_closed()
            }
        });
    }
}

fn with_api_version(mut obj: DynamicObject, api_version: &str) -> DynamicObject {
    if let Some(types) = &mut obj.types {
        types.api_version = api_version.to_string();
    }
    obj
}

#[async_trait]
impl ClusterApi for MockCluster {
    fn server_url(&self) -> String {
        "https://mock-cluster".to_string()
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().version.clone())
    }

    async fn discover(&self) -> Result<Vec<ApiInfo>> {
        let mut state = self.state.lock().unwrap();
        state.discover_calls += 1;
        if state.fail_discover {
            return Err(Error::Kube(api_error(500, "InternalError")));
        }
        Ok(state.kinds.clone())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<ObjectList<DynamicObject>> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        let gk = GroupKind::new(&resource.group, &resource.kind);
        let items = state
            .objects
            .get(&gk)
            .map(|objs| {
                objs.values()
                    .filter(|obj| namespace.is_none_or(|ns| obj.metadata.namespace.as_deref() == Some(ns)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(ObjectList {
            types: TypeMeta {
                api_version: resource.api_version.clone(),
                kind: format!("{}List", resource.kind),
            },
            metadata: ListMeta {
                resource_version: Some(state.resource_version.to_string()),
                ..ListMeta::default()
            },
            items,
        })
    }

    async fn watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        _resource_version: &str,
    ) -> Result<BoxStream<'static, kube::Result<WatchEvent<DynamicObject>>>> {
        let gk = GroupKind::new(&resource.group, &resource.kind);
        let mut state = self.state.lock().unwrap();
        if state.gone_kinds.remove(&gk) {
            return Err(Error::Kube(api_error(410, "Expired")));
        }
        if !state.kinds.iter().any(|info| info.group_kind() == gk) {
            return Err(Error::Kube(api_error(404, "NotFound")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(Watcher {
            gk,
            namespace: namespace.map(ToString::to_string),
            tx,
        });
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        let mut state = self.state.lock().unwrap();
        state.get_calls += 1;
        let key = ResourceKey::new(&gvk.group, &gvk.kind, namespace.unwrap_or_default(), name);
        let found = state
            .objects
            .get(&key.group_kind())
            .and_then(|objs| objs.get(&key))
            .cloned();
        match found {
            Some(obj) => Ok(with_api_version(obj, &gvk.api_version())),
            None => Err(Error::Kube(api_error(404, "NotFound"))),
        }
    }

    async fn convert(
        &self,
        obj: &DynamicObject,
        target_api_version: &str,
    ) -> Result<DynamicObject> {
        let state = self.state.lock().unwrap();
        if state.fail_conversion {
            return Err(Error::Conversion {
                kind: obj.types.as_ref().map(|tm| tm.kind.clone()).unwrap_or_default(),
                from: obj.types.as_ref().map(|tm| tm.api_version.clone()).unwrap_or_default(),
                to: target_api_version.to_string(),
            });
        }
        Ok(with_api_version(obj.clone(), target_api_version))
    }
}

/// Poll an async condition until it holds, failing the test if it never does.
pub async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait until the cache has at least `count` open streams for the kind.
///
/// Streams open asynchronously after a sync returns, and this fake does not
/// replay missed history, so tests park here before mutating watched state.
pub async fn wait_for_watchers(mock: &Arc<MockCluster>, group: &str, kind: &str, count: usize) {
    wait_for("watch stream registration", || {
        let mock = mock.clone();
        let (group, kind) = (group.to_string(), kind.to_string());
        async move { mock.watcher_count(&group, &kind) >= count }
    })
    .await;
}
