//! Cached resource nodes and their identity types.

use std::{any::Any, fmt, str::FromStr, sync::Arc};

use ahash::AHashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{api::DynamicObject, core::gvk::GroupVersion};

/// The namespace-scoped map handed to update callbacks and hierarchy actions.
pub type ResourceMap = AHashMap<ResourceKey, Arc<Resource>>;

const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
const SERVICE_ACCOUNT_UID_ANNOTATION: &str = "kubernetes.io/service-account.uid";
const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

/// A kind identity independent of API version.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    /// API group, empty for the core group.
    pub group: String,
    /// PascalCase kind name.
    pub kind: String,
}

impl GroupKind {
    /// Construct from explicit group and kind.
    pub fn new(group: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Unique address of a cached object.
///
/// Keys order lexicographically by `(group, kind, namespace, name)`, which for
/// legal Kubernetes identifiers coincides with the ordering of their
/// `Display` form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// API group, empty for the core group.
    pub group: String,
    /// Kind name.
    pub kind: String,
    /// Namespace, empty for cluster-scoped objects.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ResourceKey {
    /// Construct from explicit parts.
    pub fn new(group: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Key of a dynamic object, using its type and object metadata.
    pub fn from_object(obj: &DynamicObject) -> Self {
        let (group, _, kind) = type_parts(obj);
        Self {
            group,
            kind,
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }

    /// The kind identity of this key.
    pub fn group_kind(&self) -> GroupKind {
        GroupKind {
            group: self.group.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.group, self.kind, self.namespace, self.name
        )
    }
}

/// Full reference to a cached object: key plus uid and API version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceRef {
    /// API group, empty for the core group.
    pub group: String,
    /// API version within the group.
    pub version: String,
    /// Kind name.
    pub kind: String,
    /// Namespace, empty for cluster-scoped objects.
    pub namespace: String,
    /// Object name.
    pub name: String,
    /// Server-assigned unique id, empty if the server did not report one.
    pub uid: String,
}

impl ResourceRef {
    /// Reference of a dynamic object.
    pub fn from_object(obj: &DynamicObject) -> Self {
        let (group, version, kind) = type_parts(obj);
        Self {
            group,
            version,
            kind,
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name: obj.metadata.name.clone().unwrap_or_default(),
            uid: obj.metadata.uid.clone().unwrap_or_default(),
        }
    }

    /// The `apiVersion` string for this reference.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// The cache key this reference addresses.
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            group: self.group.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.api_version(), self.kind, self.namespace, self.name)
    }
}

/// One cached object.
///
/// Nodes are immutable: events replace them wholesale rather than mutating
/// them in place, so handed-out `Arc`s stay consistent snapshots.
pub struct Resource {
    /// Identity of the object.
    pub object_ref: ResourceRef,
    /// Opaque version token reported by the server.
    pub resource_version: String,
    /// Owner references after synthetic-ownership corrections.
    pub owner_refs: Vec<OwnerReference>,
    /// Opaque payload computed by the populate callback, if any.
    ///
    /// The cache never inspects this; consumers downcast it.
    pub info: Option<Arc<dyn Any + Send + Sync>>,
    /// The full object, retained only when the populate callback asked for it.
    pub resource: Option<DynamicObject>,
}

impl Resource {
    /// The cache key of this node.
    pub fn key(&self) -> ResourceKey {
        self.object_ref.key()
    }

    /// True for roots of the ownership forest.
    pub fn is_top_level(&self) -> bool {
        self.owner_refs.is_empty()
    }

    /// Whether `child` declares this node as one of its owners.
    ///
    /// Matching is by uid when the owner reference carries one, and by
    /// `(group, kind, name)` otherwise.
    pub fn is_parent_of(&self, child: &Resource) -> bool {
        child.owner_refs.iter().any(|owner| {
            if owner.uid.is_empty() {
                let owner_group = GroupVersion::from_str(&owner.api_version)
                    .map(|gv| gv.group)
                    .unwrap_or_default();
                owner_group == self.object_ref.group
                    && owner.kind == self.object_ref.kind
                    && owner.name == self.object_ref.name
            } else {
                owner.uid == self.object_ref.uid
            }
        })
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("ref", &self.object_ref)
            .field("resource_version", &self.resource_version)
            .field("owner_refs", &self.owner_refs.len())
            .field("cached", &self.resource.is_some())
            .finish()
    }
}

fn type_parts(obj: &DynamicObject) -> (String, String, String) {
    match &obj.types {
        Some(tm) => {
            let gv = GroupVersion::from_str(&tm.api_version).unwrap_or(GroupVersion {
                group: String::new(),
                version: tm.api_version.clone(),
            });
            (gv.group, gv.version, tm.kind.clone())
        }
        None => (String::new(), String::new(), String::new()),
    }
}

/// Owner references of `obj`, with the two known upstream gaps compensated:
/// endpoints objects that belong to a same-named service, and service account
/// token secrets that belong to the annotated service account.
pub(crate) fn owner_refs_with_synthetics(obj: &DynamicObject) -> Vec<OwnerReference> {
    let mut owner_refs = obj.metadata.owner_references.clone().unwrap_or_default();
    let (group, _, kind) = type_parts(obj);
    if !group.is_empty() {
        return owner_refs;
    }

    if kind == "Endpoints" && owner_refs.is_empty() {
        owner_refs.push(OwnerReference {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            name: obj.metadata.name.clone().unwrap_or_default(),
            ..OwnerReference::default()
        });
    }

    if kind == "Secret" && obj.data.get("type").and_then(|v| v.as_str()) == Some(SERVICE_ACCOUNT_TOKEN_TYPE) {
        let annotations = obj.metadata.annotations.as_ref();
        let sa_uid = annotations.and_then(|a| a.get(SERVICE_ACCOUNT_UID_ANNOTATION));
        let sa_name = annotations.and_then(|a| a.get(SERVICE_ACCOUNT_NAME_ANNOTATION));
        if let (Some(uid), Some(name)) = (sa_uid, sa_name) {
            owner_refs.push(OwnerReference {
                api_version: "v1".to_string(),
                kind: "ServiceAccount".to_string(),
                name: name.clone(),
                uid: uid.clone(),
                ..OwnerReference::default()
            });
        }
    }

    owner_refs
}
