//! Resource gateway: the seam between the propagation engine and the cloud API.
//!
//! The engine only talks to [`ResourceGateway`]. Implementations drain
//! pagination before returning, translate provider field shapes into the
//! records in [`crate::model`], and classify failures so the engine can decide
//! whether a retry is worthwhile.
pub(crate) mod credentials;
pub(crate) mod ec2;
#[cfg(test)]
pub(crate) mod memory;
mod sigv4;

use crate::model::{Instance, Snapshot, TagMap, Volume};
use std::collections::BTreeMap;
use thiserror::Error;

pub(crate) use credentials::resolve_credentials;
pub(crate) use ec2::Ec2Gateway;

/// Provider limit on the number of values a single list filter accepts.
pub const MAX_FILTER_VALUES: usize = 200;

/// EC2 filter name -> accepted values, e.g. `tag:Env -> [prod]`.
pub type InstanceFilter = BTreeMap<String, Vec<String>>;

/// Error codes the provider uses for throttling and server-side trouble.
const TRANSIENT_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "ServiceUnavailable",
    "InternalError",
    "Unavailable",
];

#[derive(Clone, Copy, Debug)]
pub enum VolumeQuery<'a> {
    All,
    /// At most [`MAX_FILTER_VALUES`] ids.
    Ids(&'a [String]),
    /// Volumes attached to any of these instances; at most [`MAX_FILTER_VALUES`].
    AttachedTo(&'a [String]),
}

#[derive(Clone, Copy, Debug)]
pub enum InstanceQuery<'a> {
    All,
    /// At most [`MAX_FILTER_VALUES`] ids.
    Ids(&'a [String]),
    Filter(&'a InstanceFilter),
}

/// Snapshot listings are always scoped to snapshots the caller owns.
#[derive(Clone, Copy, Debug)]
pub enum SnapshotQuery<'a> {
    All,
    /// At most [`MAX_FILTER_VALUES`] ids.
    Ids(&'a [String]),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("could not reach the endpoint: {0}")]
    Transport(String),
    #[error("{code} (http {status}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },
    #[error("unexpected response: {0}")]
    Malformed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Whether retrying the same call may succeed.
    ///
    /// Connectivity failures, 5xx responses, and throttling are transient;
    /// anything the provider rejected as a bad request is not.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Service { status, code, .. } => {
                *status >= 500 || TRANSIENT_CODES.contains(&code.as_str())
            }
            GatewayError::Malformed(_) | GatewayError::InvalidRequest(_) => false,
        }
    }

    /// Short code for log lines.
    pub fn code(&self) -> &str {
        match self {
            GatewayError::Transport(_) => "Transport",
            GatewayError::Service { code, .. } => code,
            GatewayError::Malformed(_) => "MalformedResponse",
            GatewayError::InvalidRequest(_) => "InvalidRequest",
        }
    }
}

pub trait ResourceGateway {
    fn list_volumes(&self, query: VolumeQuery<'_>) -> Result<Vec<Volume>, GatewayError>;

    fn list_instances(&self, query: InstanceQuery<'_>) -> Result<Vec<Instance>, GatewayError>;

    fn list_snapshots(&self, query: SnapshotQuery<'_>) -> Result<Vec<Snapshot>, GatewayError>;

    /// Current tags of a single resource; unknown ids yield an empty map.
    fn resource_tags(&self, resource_id: &str) -> Result<TagMap, GatewayError>;

    /// Create or overwrite every tag in `tags` on the resource in one call.
    fn write_tags(&self, resource_id: &str, tags: &TagMap) -> Result<(), GatewayError>;
}

impl<G: ResourceGateway + ?Sized> ResourceGateway for &G {
    fn list_volumes(&self, query: VolumeQuery<'_>) -> Result<Vec<Volume>, GatewayError> {
        (**self).list_volumes(query)
    }

    fn list_instances(&self, query: InstanceQuery<'_>) -> Result<Vec<Instance>, GatewayError> {
        (**self).list_instances(query)
    }

    fn list_snapshots(&self, query: SnapshotQuery<'_>) -> Result<Vec<Snapshot>, GatewayError> {
        (**self).list_snapshots(query)
    }

    fn resource_tags(&self, resource_id: &str) -> Result<TagMap, GatewayError> {
        (**self).resource_tags(resource_id)
    }

    fn write_tags(&self, resource_id: &str, tags: &TagMap) -> Result<(), GatewayError> {
        (**self).write_tags(resource_id, tags)
    }
}
