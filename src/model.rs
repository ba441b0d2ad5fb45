//! Canonical in-memory resource records.
//!
//! Every gateway translates its wire shapes into these types, so the engine
//! only ever sees one representation of an instance, volume, or snapshot.
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Ordered tag mapping; one value per key.
pub type TagMap = BTreeMap<String, String>;

/// Volume id -> volume record, built once per run by the volume pass.
pub type VolumeIndex = HashMap<String, Volume>;

/// Instance id -> instance record, built by the volume pass.
pub type InstanceIndex = HashMap<String, Instance>;

/// Tag key carrying the attached instance id on a volume.
pub const INSTANCE_ID_TAG: &str = "instance_id";

/// Tag key carrying the attachment device path on a volume.
pub const DEVICE_TAG: &str = "device";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub tags: TagMap,
}

/// Volume lifecycle state as reported by the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VolumeStatus {
    InUse,
    Available,
    Other(String),
}

impl VolumeStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "in-use" => VolumeStatus::InUse,
            "available" => VolumeStatus::Available,
            other => VolumeStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeStatus::InUse => f.write_str("in-use"),
            VolumeStatus::Available => f.write_str("available"),
            VolumeStatus::Other(raw) => f.write_str(raw),
        }
    }
}

/// Where a volume is attached. Either half may be missing while the
/// provider is still attaching or detaching.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attachment {
    pub instance_id: Option<String>,
    pub device: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Volume {
    pub id: String,
    pub status: VolumeStatus,
    /// Size in GiB; only reported in logs.
    pub size_gib: u64,
    pub attachment: Option<Attachment>,
    pub tags: TagMap,
}

impl Volume {
    pub fn is_in_use(&self) -> bool {
        self.status == VolumeStatus::InUse
    }

    pub fn attached_instance_id(&self) -> Option<&str> {
        self.attachment
            .as_ref()
            .and_then(|attachment| attachment.instance_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn attached_device(&self) -> Option<&str> {
        self.attachment
            .as_ref()
            .and_then(|attachment| attachment.device.as_deref())
            .filter(|device| !device.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    /// Source volume; may be empty for copied or imported snapshots.
    pub volume_id: String,
    pub tags: TagMap,
}

/// A resource whose tags the engine can rewrite.
pub trait Taggable {
    fn resource_id(&self) -> &str;
    fn tags(&self) -> &TagMap;
    fn tags_mut(&mut self) -> &mut TagMap;
}

impl Taggable for Volume {
    fn resource_id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> &TagMap {
        &self.tags
    }

    fn tags_mut(&mut self) -> &mut TagMap {
        &mut self.tags
    }
}

impl Taggable for Snapshot {
    fn resource_id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> &TagMap {
        &self.tags
    }

    fn tags_mut(&mut self) -> &mut TagMap {
        &mut self.tags
    }
}

/// Render a tag map as `{key: value, ...}` for log lines.
pub fn display_tags(tags: &TagMap) -> String {
    let body = tags
        .iter()
        .map(|(key, value)| format!("{key}: {value}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{body}}}")
}
