//! Tag propagation engine.
//!
//! Copies tags from EC2 instances to their attached EBS volumes, then from
//! volumes to the snapshots taken of them. The engine is sequential: one
//! resource is fully handled (decide, diff, write) before the next starts,
//! and a failing resource never stops the pass.
mod cache;
mod merge;
mod retry;

pub use cache::TagCache;
pub use retry::RetryPolicy;

use crate::gateway::{
    GatewayError, InstanceFilter, InstanceQuery, ResourceGateway, SnapshotQuery, VolumeQuery,
    MAX_FILTER_VALUES,
};
use crate::model::{
    display_tags, InstanceIndex, Snapshot, TagMap, Taggable, Volume, VolumeIndex,
};
use anyhow::{Context, Result};
use retry::RetryError;
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Tag count per resource the provider currently accepts.
pub const PROVIDER_TAG_LIMIT: usize = 50;

/// Which tags flow where. Invariant for a run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropagationRules {
    /// Instance tag keys copied onto attached volumes, in order.
    pub instance_tags_to_propagate: Vec<String>,
    /// Volume tag keys copied onto snapshots, in order.
    pub volume_tags_to_propagate: Vec<String>,
    /// Forced onto every tagged volume; wins over propagated values.
    pub volume_tags_to_be_set: TagMap,
    /// Forced onto every tagged snapshot; wins over propagated values.
    pub snapshot_tags_to_be_set: TagMap,
    /// Keep tags already on the target unless overwritten.
    pub append: bool,
    /// Log intended writes instead of performing them.
    pub dry_run: bool,
}

/// Which resources a run looks at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceSelection {
    pub volumes: Option<Vec<String>>,
    pub snapshots: Option<Vec<String>>,
    pub instance_filter: Option<InstanceFilter>,
    pub skip_volumes: bool,
    pub skip_snapshots: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NotInUse,
    MissingSourceVolume,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotInUse => f.write_str("volume not in use"),
            SkipReason::MissingSourceVolume => f.write_str("source volume not found"),
        }
    }
}

/// What happened to one volume or snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagOutcome {
    /// One write carrying this many keys.
    Written(usize),
    Unchanged,
    DryRun,
    Skipped(SkipReason),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub written: usize,
    /// Keys written across all resources of the pass.
    pub tags_written: usize,
    pub unchanged: usize,
    pub dry_run: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PassSummary {
    fn record(&mut self, outcome: TagOutcome) {
        match outcome {
            TagOutcome::Written(keys) => {
                self.written += 1;
                self.tags_written += keys;
            }
            TagOutcome::Unchanged => self.unchanged += 1,
            TagOutcome::DryRun => self.dry_run += 1,
            TagOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub volumes: PassSummary,
    pub snapshots: PassSummary,
}

#[derive(Clone, Copy, Debug)]
enum ResourceKind {
    Volume,
    Snapshot,
}

impl ResourceKind {
    fn label(self) -> &'static str {
        match self {
            ResourceKind::Volume => "volume",
            ResourceKind::Snapshot => "snapshot",
        }
    }
}

/// Runs the volume and snapshot passes against a gateway.
pub struct Propagator<G> {
    gateway: G,
    rules: PropagationRules,
    selection: ResourceSelection,
    retry: RetryPolicy,
    cache: TagCache,
    report: RunReport,
}

impl<G: ResourceGateway> Propagator<G> {
    pub fn new(gateway: G, rules: PropagationRules, selection: ResourceSelection) -> Self {
        Self {
            gateway,
            rules,
            selection,
            retry: RetryPolicy::default(),
            cache: TagCache::new(),
            report: RunReport::default(),
        }
    }

    #[cfg(test)]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Tag volumes from instances, then snapshots from volumes.
    ///
    /// The volume index built by the first pass is handed to the second so
    /// snapshot tagging sees the tags just written without refetching.
    pub fn propagate_tags(&mut self) -> Result<()> {
        let mut volumes = if self.selection.skip_volumes {
            tracing::info!("Skipping volume tagging");
            VolumeIndex::new()
        } else {
            self.tag_volumes()?
        };
        if self.selection.skip_snapshots {
            tracing::info!("Skipping snapshot tagging");
        } else {
            self.tag_snapshots(&mut volumes)?;
        }
        Ok(())
    }

    /// Tag every in-use volume in the selection and return all fetched
    /// volumes, tagged or not, keyed by id.
    pub fn tag_volumes(&mut self) -> Result<VolumeIndex> {
        let (mut volumes, instances) = self.select_volumes()?;
        if volumes.is_empty() {
            tracing::info!("No volumes found");
            return Ok(VolumeIndex::new());
        }
        let total = volumes.len();
        tracing::info!("Found {total} volume(s)");
        let retry = self.retry.clone();
        let mut total_size_gib: u64 = 0;
        for (position, volume) in volumes.iter_mut().enumerate() {
            tracing::info!("Processing volume {} of {total} total volumes", position + 1);
            total_size_gib += volume.size_gib;
            if !volume.is_in_use() {
                tracing::debug!(
                    volume_id = volume.id.as_str(),
                    status = %volume.status,
                    "Skipping volume as it is not attached to an instance, so there is nothing to propagate"
                );
                self.report
                    .volumes
                    .record(TagOutcome::Skipped(SkipReason::NotInUse));
                continue;
            }
            let volume_id = volume.id.clone();
            let result = retry.run(&volume_id, || self.tag_volume(volume, &instances));
            record_result(
                &mut self.report.volumes,
                ResourceKind::Volume,
                &volume_id,
                result,
            );
        }
        tracing::info!(
            total_size_gib,
            written = self.report.volumes.written,
            tags_written = self.report.volumes.tags_written,
            unchanged = self.report.volumes.unchanged,
            dry_run = self.report.volumes.dry_run,
            skipped = self.report.volumes.skipped,
            failed = self.report.volumes.failed,
            "Completed processing all volumes"
        );
        Ok(volumes
            .into_iter()
            .map(|volume| (volume.id.clone(), volume))
            .collect())
    }

    /// Decide and write the tags of one attached volume.
    pub fn tag_volume(
        &mut self,
        volume: &mut Volume,
        instances: &InstanceIndex,
    ) -> Result<TagOutcome, GatewayError> {
        let instance_tags = match volume.attached_instance_id() {
            Some(instance_id) => match instances.get(instance_id) {
                Some(instance) => instance.tags.clone(),
                None => self.cache.resource_tags(&self.gateway, instance_id)?,
            },
            None => TagMap::new(),
        };
        let desired = merge::desired_volume_tags(volume, &instance_tags, &self.rules);
        self.apply(ResourceKind::Volume, volume, &desired)
    }

    /// Tag every selected snapshot from its source volume.
    ///
    /// Source volumes missing from `volumes` are fetched and added to it first.
    pub fn tag_snapshots(&mut self, volumes: &mut VolumeIndex) -> Result<()> {
        let mut snapshots = self.select_snapshots()?;
        if snapshots.is_empty() {
            tracing::info!("No snapshots found");
            return Ok(());
        }
        let total = snapshots.len();
        tracing::info!("Found {total} snapshot(s)");
        self.fetch_missing_volumes(&snapshots, volumes)?;
        let volumes: &VolumeIndex = volumes;
        let retry = self.retry.clone();
        for (position, snapshot) in snapshots.iter_mut().enumerate() {
            tracing::info!("Processing snapshot {} of {total} total snapshots", position + 1);
            let snapshot_id = snapshot.id.clone();
            let result = retry.run(&snapshot_id, || self.tag_snapshot(snapshot, volumes));
            record_result(
                &mut self.report.snapshots,
                ResourceKind::Snapshot,
                &snapshot_id,
                result,
            );
        }
        tracing::info!(
            written = self.report.snapshots.written,
            tags_written = self.report.snapshots.tags_written,
            unchanged = self.report.snapshots.unchanged,
            dry_run = self.report.snapshots.dry_run,
            skipped = self.report.snapshots.skipped,
            failed = self.report.snapshots.failed,
            "Completed processing all snapshots"
        );
        Ok(())
    }

    /// Decide and write the tags of one snapshot.
    pub fn tag_snapshot(
        &mut self,
        snapshot: &mut Snapshot,
        volumes: &VolumeIndex,
    ) -> Result<TagOutcome, GatewayError> {
        let Some(volume) = volumes.get(&snapshot.volume_id) else {
            tracing::info!(
                snapshot_id = snapshot.id.as_str(),
                volume_id = snapshot.volume_id.as_str(),
                "Skipping snapshot as its source volume could not be found"
            );
            return Ok(TagOutcome::Skipped(SkipReason::MissingSourceVolume));
        };
        let desired = merge::desired_snapshot_tags(snapshot, &volume.tags, &self.rules);
        self.apply(ResourceKind::Snapshot, snapshot, &desired)
    }

    fn apply<R: Taggable>(
        &mut self,
        kind: ResourceKind,
        resource: &mut R,
        desired: &TagMap,
    ) -> Result<TagOutcome, GatewayError> {
        warn_if_over_limit(kind, resource.resource_id(), resource.tags(), desired);
        if self.rules.dry_run {
            tracing::info!(
                "DRYRUN: {} {} would have been tagged {}",
                kind.label(),
                resource.resource_id(),
                display_tags(desired)
            );
            return Ok(TagOutcome::DryRun);
        }
        self.commit_tags(resource, desired)
    }

    /// Write the part of `desired` that differs from the resource's current
    /// tags in a single call, then mirror it onto the in-memory record.
    fn commit_tags<R: Taggable>(
        &mut self,
        resource: &mut R,
        desired: &TagMap,
    ) -> Result<TagOutcome, GatewayError> {
        let delta = merge::tag_delta(resource.tags(), desired);
        if delta.is_empty() {
            tracing::debug!(
                resource_id = resource.resource_id(),
                "tags already up to date"
            );
            return Ok(TagOutcome::Unchanged);
        }
        for (key, value) in &delta {
            tracing::info!("Tagging {} with [{key}: {value}]", resource.resource_id());
        }
        self.gateway.write_tags(resource.resource_id(), &delta)?;
        let written = delta.len();
        resource.tags_mut().extend(delta);
        self.cache.invalidate(resource.resource_id());
        Ok(TagOutcome::Written(written))
    }

    fn select_volumes(&self) -> Result<(Vec<Volume>, InstanceIndex)> {
        let gateway = &self.gateway;
        if let Some(requested) = self.selection.volumes.as_deref().filter(|ids| !ids.is_empty()) {
            tracing::info!("Using volume list from cli/config file");
            let requested = unique(requested.iter().map(String::as_str));
            let volumes = self.list_in_chunks("volumes", &requested, |chunk| {
                gateway.list_volumes(VolumeQuery::Ids(chunk))
            })?;
            report_unknown("Volume", &requested, volumes.iter().map(|v| v.id.as_str()));
            let instance_ids = unique(volumes.iter().filter_map(Volume::attached_instance_id));
            let instances = self.list_in_chunks("instances", &instance_ids, |chunk| {
                gateway.list_instances(InstanceQuery::Ids(chunk))
            })?;
            return Ok((volumes, index_instances(instances)));
        }
        if let Some(filter) = &self.selection.instance_filter {
            tracing::info!(?filter, "Using instance filter from config file");
            let instances =
                self.list("instances", || gateway.list_instances(InstanceQuery::Filter(filter)))?;
            let instance_ids = unique(instances.iter().map(|instance| instance.id.as_str()));
            let volumes = self.list_in_chunks("volumes", &instance_ids, |chunk| {
                gateway.list_volumes(VolumeQuery::AttachedTo(chunk))
            })?;
            return Ok((volumes, index_instances(instances)));
        }
        tracing::info!("Getting list of all volumes");
        let volumes = self.list("volumes", || gateway.list_volumes(VolumeQuery::All))?;
        if volumes.is_empty() {
            return Ok((volumes, InstanceIndex::new()));
        }
        tracing::info!("Getting list of all instances");
        let instances = self.list("instances", || gateway.list_instances(InstanceQuery::All))?;
        Ok((volumes, index_instances(instances)))
    }

    fn select_snapshots(&self) -> Result<Vec<Snapshot>> {
        let gateway = &self.gateway;
        if let Some(requested) = self.selection.snapshots.as_deref().filter(|ids| !ids.is_empty()) {
            tracing::info!("Using snapshot list from cli/config file");
            let requested = unique(requested.iter().map(String::as_str));
            let snapshots = self.list_in_chunks("snapshots", &requested, |chunk| {
                gateway.list_snapshots(SnapshotQuery::Ids(chunk))
            })?;
            report_unknown(
                "Snapshot",
                &requested,
                snapshots.iter().map(|s| s.id.as_str()),
            );
            return Ok(snapshots);
        }
        tracing::info!("Getting list of all snapshots");
        self.list("snapshots", || gateway.list_snapshots(SnapshotQuery::All))
    }

    /// Fetch source volumes of `snapshots` that the index does not hold yet.
    fn fetch_missing_volumes(&self, snapshots: &[Snapshot], volumes: &mut VolumeIndex) -> Result<()> {
        let missing = unique(
            snapshots
                .iter()
                .map(|snapshot| snapshot.volume_id.as_str())
                .filter(|id| !id.is_empty() && !volumes.contains_key(*id)),
        );
        if missing.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = missing.len(), "fetching source volumes of snapshots");
        let gateway = &self.gateway;
        let fetched = self.list_in_chunks("volumes", &missing, |chunk| {
            gateway.list_volumes(VolumeQuery::Ids(chunk))
        })?;
        volumes.extend(fetched.into_iter().map(|volume| (volume.id.clone(), volume)));
        Ok(())
    }

    fn list<T>(&self, what: &str, op: impl FnMut() -> Result<T, GatewayError>) -> Result<T> {
        self.retry
            .run(what, op)
            .with_context(|| format!("list {what}"))
    }

    /// List by id in filter-sized chunks, concatenating results in order.
    fn list_in_chunks<T>(
        &self,
        what: &str,
        ids: &[String],
        mut fetch: impl FnMut(&[String]) -> Result<Vec<T>, GatewayError>,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for chunk in ids.chunks(MAX_FILTER_VALUES) {
            items.extend(self.list(what, || fetch(chunk))?);
        }
        Ok(items)
    }
}

fn record_result(
    summary: &mut PassSummary,
    kind: ResourceKind,
    resource_id: &str,
    result: Result<TagOutcome, RetryError>,
) {
    match result {
        Ok(TagOutcome::Skipped(reason)) => {
            tracing::debug!("Skipped {} {resource_id}: {reason}", kind.label());
            summary.record(TagOutcome::Skipped(reason));
        }
        Ok(outcome) => summary.record(outcome),
        Err(RetryError::Rejected(err)) => {
            summary.failed += 1;
            tracing::error!(
                code = err.code(),
                "Encountered error {err} on {} {resource_id}",
                kind.label()
            );
        }
        Err(RetryError::Exhausted { attempts, last }) => {
            summary.failed += 1;
            tracing::error!(
                code = last.code(),
                "Encountered error {last} on {} {resource_id}, {attempts} attempts failed, continuing",
                kind.label()
            );
        }
    }
}

fn warn_if_over_limit(kind: ResourceKind, resource_id: &str, current: &TagMap, desired: &TagMap) {
    let projected: BTreeSet<&String> = current.keys().chain(desired.keys()).collect();
    if projected.len() > PROVIDER_TAG_LIMIT {
        tracing::warn!(
            resource_id,
            tag_count = projected.len(),
            limit = PROVIDER_TAG_LIMIT,
            "{} would exceed the provider tag limit; the write is likely to be rejected",
            kind.label()
        );
    }
}

/// Deduplicate ids keeping first-seen order.
fn unique<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}

fn report_unknown<'a>(label: &str, requested: &[String], found: impl Iterator<Item = &'a str>) {
    let found: HashSet<&str> = found.collect();
    for id in requested.iter().filter(|id| !found.contains(id.as_str())) {
        tracing::info!("{label} {id} does not exist and will not be tagged");
    }
}

fn index_instances(instances: Vec<crate::model::Instance>) -> InstanceIndex {
    instances
        .into_iter()
        .map(|instance| (instance.id.clone(), instance))
        .collect()
}

#[cfg(test)]
#[path = "propagate_tests.rs"]
mod tests;
