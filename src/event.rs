use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/* ============================= OBJECT IDS ============================= */

/// Build the global object identity `"<clusterID>:<namespace>/<name>/<uid>"`.
///
/// Equal object IDs mean the same logical object, across events and clusters.
pub fn object_id(cluster_id: &str, meta: &ObjectMeta) -> String {
    format!(
        "{}:{}/{}/{}",
        cluster_id,
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
        meta.uid.as_deref().unwrap_or_default()
    )
}

/* ============================= TYPES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Updated,
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Added => "Added",
            EventType::Updated => "Updated",
            EventType::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Pod,
    NetworkPolicy,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectKind::Pod => "pod",
            ObjectKind::NetworkPolicy => "np",
        };
        f.write_str(s)
    }
}

/// Typed event payload. Updates carry the previous object alongside the new
/// one; adds and deletes carry a single object.
#[derive(Debug, Clone)]
pub enum EventPayload {
    Pod {
        old: Option<Box<Pod>>,
        new: Box<Pod>,
    },
    NetworkPolicy {
        old: Option<Box<NetworkPolicy>>,
        new: Box<NetworkPolicy>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> ObjectKind {
        match self {
            EventPayload::Pod { .. } => ObjectKind::Pod,
            EventPayload::NetworkPolicy { .. } => ObjectKind::NetworkPolicy,
        }
    }
}

/// A normalized watch event from one cluster, as consumed by the controller's
/// processing loop.
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    pub cluster_id: String,
    pub event_type: EventType,
    pub obj_id: String,
    pub payload: EventPayload,
}

/* ============================= WATCHED KINDS ============================= */

/// The two object kinds the engine watches. Gives the event constructors a
/// single generic surface instead of one set of helpers per kind.
pub trait Watched: Clone + Send + Sized + 'static {
    const KIND: ObjectKind;

    fn object_meta(&self) -> &ObjectMeta;

    fn into_payload(old: Option<Self>, new: Self) -> EventPayload;
}

impl Watched for Pod {
    const KIND: ObjectKind = ObjectKind::Pod;

    fn object_meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn into_payload(old: Option<Self>, new: Self) -> EventPayload {
        EventPayload::Pod {
            old: old.map(Box::new),
            new: Box::new(new),
        }
    }
}

impl Watched for NetworkPolicy {
    const KIND: ObjectKind = ObjectKind::NetworkPolicy;

    fn object_meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn into_payload(old: Option<Self>, new: Self) -> EventPayload {
        EventPayload::NetworkPolicy {
            old: old.map(Box::new),
            new: Box::new(new),
        }
    }
}

/* ============================= CONSTRUCTION ============================= */

impl ClusterEvent {
    pub fn added<T: Watched>(cluster_id: &str, obj: T) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            event_type: EventType::Added,
            obj_id: object_id(cluster_id, obj.object_meta()),
            payload: T::into_payload(None, obj),
        }
    }

    pub fn updated<T: Watched>(cluster_id: &str, old: T, new: T) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            event_type: EventType::Updated,
            obj_id: object_id(cluster_id, new.object_meta()),
            payload: T::into_payload(Some(old), new),
        }
    }

    pub fn deleted<T: Watched>(cluster_id: &str, obj: T) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            event_type: EventType::Deleted,
            obj_id: object_id(cluster_id, obj.object_meta()),
            payload: T::into_payload(None, obj),
        }
    }

    /// Reinterpret this event as an Add of its newest object, dropping any
    /// carried previous state. Used when an update arrives for an object the
    /// index never saw.
    pub fn to_added(&self) -> Self {
        let payload = match &self.payload {
            EventPayload::Pod { new, .. } => EventPayload::Pod {
                old: None,
                new: new.clone(),
            },
            EventPayload::NetworkPolicy { new, .. } => EventPayload::NetworkPolicy {
                old: None,
                new: new.clone(),
            },
        };
        Self {
            cluster_id: self.cluster_id.clone(),
            event_type: EventType::Added,
            obj_id: self.obj_id.clone(),
            payload,
        }
    }

    pub fn new_pod(&self) -> Option<&Pod> {
        match &self.payload {
            EventPayload::Pod { new, .. } => Some(new),
            EventPayload::NetworkPolicy { .. } => None,
        }
    }

    pub fn old_pod(&self) -> Option<&Pod> {
        match &self.payload {
            EventPayload::Pod { old, .. } => old.as_deref(),
            EventPayload::NetworkPolicy { .. } => None,
        }
    }

    pub fn new_policy(&self) -> Option<&NetworkPolicy> {
        match &self.payload {
            EventPayload::NetworkPolicy { new, .. } => Some(new),
            EventPayload::Pod { .. } => None,
        }
    }

    pub fn old_policy(&self) -> Option<&NetworkPolicy> {
        match &self.payload {
            EventPayload::NetworkPolicy { old, .. } => old.as_deref(),
            EventPayload::Pod { .. } => None,
        }
    }
}

/* ============================= TESTS ============================= */
