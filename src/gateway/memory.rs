//! In-memory gateway for tests. Records every call and can be scripted to
//! fail writes, so pass behaviour can be asserted without a provider.
use super::{
    GatewayError, InstanceQuery, ResourceGateway, SnapshotQuery, VolumeQuery, MAX_FILTER_VALUES,
};
use crate::model::{Instance, Snapshot, TagMap, Volume};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    /// `None` for an unfiltered listing, otherwise the number of filter values.
    ListVolumes(Option<usize>),
    ListInstances(Option<usize>),
    ListSnapshots(Option<usize>),
    ResourceTags(String),
    WriteTags(String, TagMap),
}

#[derive(Default)]
pub(crate) struct InMemoryGateway {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    instances: Vec<Instance>,
    volumes: Vec<Volume>,
    snapshots: Vec<Snapshot>,
    calls: Vec<Call>,
    write_failures: HashMap<String, VecDeque<GatewayError>>,
    list_failures: VecDeque<GatewayError>,
}

impl InMemoryGateway {
    pub(crate) fn new(instances: Vec<Instance>, volumes: Vec<Volume>, snapshots: Vec<Snapshot>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                instances,
                volumes,
                snapshots,
                ..Inner::default()
            }),
        }
    }

    /// Queue errors returned by successive writes to `resource_id`.
    pub(crate) fn fail_writes(&self, resource_id: &str, errors: Vec<GatewayError>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .write_failures
            .entry(resource_id.to_string())
            .or_default()
            .extend(errors);
    }

    /// Queue errors returned by the next list calls of any kind.
    pub(crate) fn fail_lists(&self, errors: Vec<GatewayError>) {
        self.inner.lock().unwrap().list_failures.extend(errors);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub(crate) fn writes(&self) -> Vec<(String, TagMap)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::WriteTags(id, tags) => Some((id, tags)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn volume_list_calls(&self) -> Vec<Option<usize>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::ListVolumes(len) => Some(len),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn volume_tags(&self, volume_id: &str) -> Option<TagMap> {
        let inner = self.inner.lock().unwrap();
        inner
            .volumes
            .iter()
            .find(|volume| volume.id == volume_id)
            .map(|volume| volume.tags.clone())
    }

    pub(crate) fn snapshot_tags(&self, snapshot_id: &str) -> Option<TagMap> {
        let inner = self.inner.lock().unwrap();
        inner
            .snapshots
            .iter()
            .find(|snapshot| snapshot.id == snapshot_id)
            .map(|snapshot| snapshot.tags.clone())
    }
}

impl Inner {
    fn begin_list(&mut self, call: Call, filter_len: Option<usize>) -> Result<(), GatewayError> {
        self.calls.push(call);
        if let Some(len) = filter_len {
            if len > MAX_FILTER_VALUES {
                return Err(GatewayError::InvalidRequest(format!(
                    "filter carries {len} values, limit is {MAX_FILTER_VALUES}"
                )));
            }
        }
        match self.list_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn instance_matches(instance: &Instance, name: &str, values: &[String]) -> bool {
    if name == "instance-id" {
        return values.contains(&instance.id);
    }
    match name.strip_prefix("tag:") {
        Some(key) => instance
            .tags
            .get(key)
            .is_some_and(|value| values.contains(value)),
        None => false,
    }
}

impl ResourceGateway for InMemoryGateway {
    fn list_volumes(&self, query: VolumeQuery<'_>) -> Result<Vec<Volume>, GatewayError> {
        let mut inner = self.inner.lock().unwrap();
        let filter_len = match query {
            VolumeQuery::All => None,
            VolumeQuery::Ids(ids) | VolumeQuery::AttachedTo(ids) => Some(ids.len()),
        };
        inner.begin_list(Call::ListVolumes(filter_len), filter_len)?;
        let volumes = inner
            .volumes
            .iter()
            .filter(|volume| match query {
                VolumeQuery::All => true,
                VolumeQuery::Ids(ids) => ids.contains(&volume.id),
                VolumeQuery::AttachedTo(instance_ids) => volume
                    .attached_instance_id()
                    .is_some_and(|id| instance_ids.iter().any(|candidate| candidate == id)),
            })
            .cloned()
            .collect();
        Ok(volumes)
    }

    fn list_instances(&self, query: InstanceQuery<'_>) -> Result<Vec<Instance>, GatewayError> {
        let mut inner = self.inner.lock().unwrap();
        let filter_len = match query {
            InstanceQuery::All => None,
            InstanceQuery::Ids(ids) => Some(ids.len()),
            InstanceQuery::Filter(filter) => filter.values().map(Vec::len).max(),
        };
        inner.begin_list(Call::ListInstances(filter_len), filter_len)?;
        let instances = inner
            .instances
            .iter()
            .filter(|instance| match query {
                InstanceQuery::All => true,
                InstanceQuery::Ids(ids) => ids.contains(&instance.id),
                InstanceQuery::Filter(filter) => filter
                    .iter()
                    .all(|(name, values)| instance_matches(instance, name, values)),
            })
            .cloned()
            .collect();
        Ok(instances)
    }

    fn list_snapshots(&self, query: SnapshotQuery<'_>) -> Result<Vec<Snapshot>, GatewayError> {
        let mut inner = self.inner.lock().unwrap();
        let filter_len = match query {
            SnapshotQuery::All => None,
            SnapshotQuery::Ids(ids) => Some(ids.len()),
        };
        inner.begin_list(Call::ListSnapshots(filter_len), filter_len)?;
        let snapshots = inner
            .snapshots
            .iter()
            .filter(|snapshot| match query {
                SnapshotQuery::All => true,
                SnapshotQuery::Ids(ids) => ids.contains(&snapshot.id),
            })
            .cloned()
            .collect();
        Ok(snapshots)
    }

    fn resource_tags(&self, resource_id: &str) -> Result<TagMap, GatewayError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::ResourceTags(resource_id.to_string()));
        let tags = inner
            .instances
            .iter()
            .find(|instance| instance.id == resource_id)
            .map(|instance| instance.tags.clone())
            .or_else(|| {
                inner
                    .volumes
                    .iter()
                    .find(|volume| volume.id == resource_id)
                    .map(|volume| volume.tags.clone())
            })
            .or_else(|| {
                inner
                    .snapshots
                    .iter()
                    .find(|snapshot| snapshot.id == resource_id)
                    .map(|snapshot| snapshot.tags.clone())
            })
            .unwrap_or_default();
        Ok(tags)
    }

    fn write_tags(&self, resource_id: &str, tags: &TagMap) -> Result<(), GatewayError> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if let Some(err) = inner
            .write_failures
            .get_mut(resource_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        inner
            .calls
            .push(Call::WriteTags(resource_id.to_string(), tags.clone()));
        let current = if let Some(volume) = inner.volumes.iter_mut().find(|v| v.id == resource_id) {
            &mut volume.tags
        } else if let Some(snapshot) = inner.snapshots.iter_mut().find(|s| s.id == resource_id) {
            &mut snapshot.tags
        } else {
            return Err(GatewayError::Service {
                status: 400,
                code: "InvalidID".to_string(),
                message: format!("unknown resource {resource_id}"),
            });
        };
        current.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}
