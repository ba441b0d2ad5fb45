//! Tag decision rules.
//!
//! Pure functions over in-memory records: which tags a volume or snapshot
//! should carry, and which of those actually need writing.
use super::PropagationRules;
use crate::model::{Snapshot, TagMap, Volume, DEVICE_TAG, INSTANCE_ID_TAG};

/// Tags a volume should carry given the tags of its attached instance.
///
/// Order of precedence, lowest first: the volume's own tags (append mode
/// only), propagated instance tags, `instance_id`/`device`, fixed volume tags.
pub fn desired_volume_tags(
    volume: &Volume,
    instance_tags: &TagMap,
    rules: &PropagationRules,
) -> TagMap {
    let mut tags = seed(&volume.tags, rules.append);
    propagate(
        &mut tags,
        instance_tags,
        &rules.instance_tags_to_propagate,
        "instance",
    );
    tags.insert(
        INSTANCE_ID_TAG.to_string(),
        volume.attached_instance_id().unwrap_or_default().to_string(),
    );
    tags.insert(
        DEVICE_TAG.to_string(),
        volume.attached_device().unwrap_or_default().to_string(),
    );
    force(&mut tags, &rules.volume_tags_to_be_set);
    tags
}

/// Tags a snapshot should carry given the current tags of its source volume.
pub fn desired_snapshot_tags(
    snapshot: &Snapshot,
    volume_tags: &TagMap,
    rules: &PropagationRules,
) -> TagMap {
    let mut tags = seed(&snapshot.tags, rules.append);
    propagate(
        &mut tags,
        volume_tags,
        &rules.volume_tags_to_propagate,
        "volume",
    );
    force(&mut tags, &rules.snapshot_tags_to_be_set);
    tags
}

/// Entries of `desired` that are missing from `current` or carry a
/// different value there. Keys only present in `current` are left alone.
pub fn tag_delta(current: &TagMap, desired: &TagMap) -> TagMap {
    desired
        .iter()
        .filter(|(key, value)| current.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn seed(existing: &TagMap, append: bool) -> TagMap {
    if append {
        existing.clone()
    } else {
        TagMap::new()
    }
}

fn propagate(tags: &mut TagMap, source: &TagMap, keys: &[String], source_kind: &str) {
    for key in keys {
        tracing::debug!(key = key.as_str(), "trying to propagate {source_kind} tag");
        if let Some(value) = source.get(key) {
            tags.insert(key.clone(), value.clone());
        }
    }
}

fn force(tags: &mut TagMap, fixed: &TagMap) {
    tags.extend(fixed.iter().map(|(key, value)| (key.clone(), value.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attachment, VolumeStatus};

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn rules() -> PropagationRules {
        PropagationRules {
            instance_tags_to_propagate: vec!["Name".to_string(), "Team".to_string()],
            ..PropagationRules::default()
        }
    }

    fn attached_volume(existing: TagMap) -> Volume {
        Volume {
            id: "vol-1".to_string(),
            status: VolumeStatus::InUse,
            size_gib: 8,
            attachment: Some(Attachment {
                instance_id: Some("i-1".to_string()),
                device: Some("/dev/sda1".to_string()),
            }),
            tags: existing,
        }
    }

    #[test]
    fn volume_gets_configured_subset_plus_attachment_tags() {
        let instance = tags(&[("Name", "web1"), ("Owner", "ops")]);
        let desired = desired_volume_tags(&attached_volume(TagMap::new()), &instance, &rules());
        assert_eq!(
            desired,
            tags(&[("Name", "web1"), ("instance_id", "i-1"), ("device", "/dev/sda1")])
        );
    }

    #[test]
    fn fixed_volume_tags_override_propagated_values() {
        let mut rules = rules();
        rules.volume_tags_to_be_set = tags(&[("Name", "pinned"), ("backup", "daily")]);
        let instance = tags(&[("Name", "web1")]);
        let desired = desired_volume_tags(&attached_volume(TagMap::new()), &instance, &rules);
        assert_eq!(desired.get("Name").map(String::as_str), Some("pinned"));
        assert_eq!(desired.get("backup").map(String::as_str), Some("daily"));
    }

    #[test]
    fn append_mode_preserves_unrelated_existing_tags() {
        let mut rules = rules();
        rules.append = true;
        let volume = attached_volume(tags(&[("env", "prod")]));
        let desired = desired_volume_tags(&volume, &tags(&[("Name", "x")]), &rules);
        assert_eq!(
            desired,
            tags(&[
                ("env", "prod"),
                ("Name", "x"),
                ("instance_id", "i-1"),
                ("device", "/dev/sda1")
            ])
        );
    }

    #[test]
    fn non_append_mode_drops_unrelated_existing_tags() {
        let volume = attached_volume(tags(&[("env", "prod")]));
        let desired = desired_volume_tags(&volume, &tags(&[("Name", "x")]), &rules());
        assert!(!desired.contains_key("env"));
    }

    #[test]
    fn append_mode_lets_propagated_keys_overwrite_manual_ones() {
        let mut rules = rules();
        rules.append = true;
        let volume = attached_volume(tags(&[("Name", "manual"), ("instance_id", "stale")]));
        let desired = desired_volume_tags(&volume, &tags(&[("Name", "web1")]), &rules);
        assert_eq!(desired.get("Name").map(String::as_str), Some("web1"));
        assert_eq!(desired.get("instance_id").map(String::as_str), Some("i-1"));
    }

    #[test]
    fn missing_attachment_is_written_as_empty_values() {
        let mut volume = attached_volume(TagMap::new());
        volume.attachment = None;
        let desired = desired_volume_tags(&volume, &TagMap::new(), &rules());
        assert_eq!(desired, tags(&[("instance_id", ""), ("device", "")]));
    }

    #[test]
    fn snapshot_has_no_attachment_tags_of_its_own() {
        let rules = PropagationRules {
            volume_tags_to_propagate: vec!["Name".to_string()],
            snapshot_tags_to_be_set: tags(&[("backup_tool", "graffiti")]),
            ..PropagationRules::default()
        };
        let snapshot = Snapshot {
            id: "snap-1".to_string(),
            volume_id: "vol-1".to_string(),
            tags: TagMap::new(),
        };
        let volume_tags = tags(&[("Name", "web1"), ("instance_id", "i-1")]);
        let desired = desired_snapshot_tags(&snapshot, &volume_tags, &rules);
        assert_eq!(desired, tags(&[("Name", "web1"), ("backup_tool", "graffiti")]));
    }

    fn snapshot_with(existing: TagMap) -> Snapshot {
        Snapshot {
            id: "snap-1".to_string(),
            volume_id: "vol-1".to_string(),
            tags: existing,
        }
    }

    #[test]
    fn snapshot_keeps_its_own_tags_only_in_append_mode() {
        let mut rules = PropagationRules {
            volume_tags_to_propagate: vec!["Name".to_string()],
            ..PropagationRules::default()
        };
        let snapshot = snapshot_with(tags(&[("retention", "30")]));
        let volume_tags = tags(&[("Name", "web1")]);

        rules.append = true;
        assert_eq!(
            desired_snapshot_tags(&snapshot, &volume_tags, &rules),
            tags(&[("retention", "30"), ("Name", "web1")])
        );

        rules.append = false;
        assert_eq!(
            desired_snapshot_tags(&snapshot, &volume_tags, &rules),
            tags(&[("Name", "web1")])
        );
    }

    #[test]
    fn fixed_snapshot_tags_override_propagated_values() {
        let rules = PropagationRules {
            volume_tags_to_propagate: vec!["Name".to_string(), "device".to_string()],
            snapshot_tags_to_be_set: tags(&[("Name", "pinned")]),
            append: true,
            ..PropagationRules::default()
        };
        let snapshot = snapshot_with(tags(&[("Name", "manual")]));
        let volume_tags = tags(&[("Name", "web1"), ("device", "/dev/sda1")]);
        let desired = desired_snapshot_tags(&snapshot, &volume_tags, &rules);
        assert_eq!(desired, tags(&[("Name", "pinned"), ("device", "/dev/sda1")]));
    }

    #[test]
    fn delta_keeps_only_new_or_changed_keys() {
        let current = tags(&[("Name", "web1"), ("device", "/dev/sda1"), ("env", "prod")]);
        let desired = tags(&[("Name", "web1"), ("device", "/dev/sdf"), ("instance_id", "i-1")]);
        assert_eq!(
            tag_delta(&current, &desired),
            tags(&[("device", "/dev/sdf"), ("instance_id", "i-1")])
        );
        assert!(tag_delta(&desired, &desired).is_empty());
    }
}
