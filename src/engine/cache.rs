//! Run-scoped memo of single-resource tag lookups.
use crate::gateway::{GatewayError, ResourceGateway};
use crate::model::TagMap;
use std::collections::HashMap;

/// Tags fetched by resource id during one run.
///
/// Only read-side lookups go through here. Writes made by the engine call
/// [`TagCache::invalidate`], and the volume index stays the source of truth
/// for freshly written tags.
#[derive(Debug, Default)]
pub struct TagCache {
    entries: HashMap<String, TagMap>,
}

impl TagCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags of `resource_id`, fetching on first use.
    ///
    /// An empty id cannot key the cache and resolves to no tags without a call.
    pub fn resource_tags<G: ResourceGateway>(
        &mut self,
        gateway: &G,
        resource_id: &str,
    ) -> Result<TagMap, GatewayError> {
        if resource_id.is_empty() {
            return Ok(TagMap::new());
        }
        if let Some(tags) = self.entries.get(resource_id) {
            tracing::debug!(resource_id, "found tags in cache");
            return Ok(tags.clone());
        }
        tracing::debug!(resource_id, "fetching tags");
        let tags = gateway.resource_tags(resource_id)?;
        self.entries.insert(resource_id.to_string(), tags.clone());
        Ok(tags)
    }

    pub fn invalidate(&mut self, resource_id: &str) {
        self.entries.remove(resource_id);
    }
}
