//! Run settings: YAML config file merged with the command line.
//!
//! The file wins over command-line values for region, profile and the id
//! lists; the environment is consulted last for the region. Propagation
//! keys and fixed tags only come from the file.
use crate::cli::Cli;
use crate::engine::{PropagationRules, ResourceSelection};
use crate::gateway::credentials::DEFAULT_PROFILE;
use crate::gateway::InstanceFilter;
use crate::model::TagMap;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Exit status for a config file that cannot be read or parsed.
pub const BAD_CONFIG_EXIT_CODE: u8 = 6;

/// Provider-reserved tag key prefix; such keys cannot be written.
const RESERVED_TAG_PREFIX: &str = "aws:";

const DEFAULT_INSTANCE_TAGS: &[&str] = &["Name"];
const DEFAULT_VOLUME_TAGS: &[&str] = &["Name", "instance_id", "device"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {} is not valid YAML; please provide a YAML mapping of settings", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config file {} is empty; please provide a YAML mapping of settings", path.display())]
    Empty { path: PathBuf },
    #[error("no region given; use --region, set region in the config file, or set AWS_REGION")]
    MissingRegion,
    #[error("invalid tag in {field}: {reason}")]
    InvalidTag { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ConfigError::Read { .. } | ConfigError::Malformed { .. } | ConfigError::Empty { .. } => {
                BAD_CONFIG_EXIT_CODE
            }
            ConfigError::MissingRegion | ConfigError::InvalidTag { .. } => 1,
        }
    }
}

/// On-disk configuration. Underscore-prefixed keys are the historical
/// spelling of the file format.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub region: Option<String>,
    pub profile: Option<String>,
    #[serde(rename = "_instance_tags_to_propagate")]
    pub instance_tags_to_propagate: Option<Vec<String>>,
    #[serde(rename = "_volume_tags_to_propagate")]
    pub volume_tags_to_propagate: Option<Vec<String>>,
    #[serde(rename = "_volume_tags_to_be_set")]
    pub volume_tags_to_be_set: Option<Vec<FixedTag>>,
    #[serde(rename = "_snapshot_tags_to_be_set")]
    pub snapshot_tags_to_be_set: Option<Vec<FixedTag>>,
    #[serde(rename = "_volumes_to_tag")]
    pub volumes_to_tag: Option<Vec<String>>,
    #[serde(rename = "_snapshots_to_tag")]
    pub snapshots_to_tag: Option<Vec<String>>,
    #[serde(rename = "_instance_filter")]
    pub instance_filter: Option<BTreeMap<String, FilterValues>>,
}

/// One `{key, value}` entry of a fixed tag list.
#[derive(Debug, Deserialize)]
pub struct FixedTag {
    pub key: String,
    #[serde(deserialize_with = "scalar_string")]
    pub value: String,
}

/// Instance filter values: a single scalar or a list. A bare `name:` with
/// no value reads as `Absent` and drops that filter.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FilterValues {
    Absent,
    One(#[serde(deserialize_with = "scalar_string")] String),
    Many(Vec<String>),
}

impl FilterValues {
    fn into_vec(self) -> Vec<String> {
        match self {
            FilterValues::Absent => Vec::new(),
            FilterValues::One(value) => vec![value],
            FilterValues::Many(values) => values,
        }
    }
}

/// Accept YAML numbers and booleans where a string is expected, so
/// `value: 30` does not need quoting.
fn scalar_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(text) => Ok(text),
        serde_yaml::Value::Number(number) => Ok(number.to_string()),
        serde_yaml::Value::Bool(flag) => Ok(flag.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        _ => Err(serde::de::Error::custom("expected a scalar value")),
    }
}

/// Everything a run needs, fully resolved.
#[derive(Debug, PartialEq, Eq)]
pub struct Settings {
    pub region: String,
    pub profile: String,
    pub rules: PropagationRules,
    pub selection: ResourceSelection,
}

pub fn load_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Err(ConfigError::Empty {
            path: path.to_path_buf(),
        });
    }
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve settings from the command line, its config file, and the
/// process environment.
pub fn resolve(cli: &Cli) -> Result<Settings, ConfigError> {
    let file = match cli.config.as_deref() {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config file");
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };
    resolve_with(cli, file, |name| std::env::var(name).ok())
}

fn resolve_with(
    cli: &Cli,
    file: ConfigFile,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Settings, ConfigError> {
    let region = non_empty(file.region)
        .or_else(|| non_empty(cli.region.clone()))
        .or_else(|| non_empty(env("AWS_REGION")))
        .or_else(|| non_empty(env("AWS_DEFAULT_REGION")))
        .ok_or(ConfigError::MissingRegion)?;
    let profile = non_empty(file.profile)
        .or_else(|| non_empty(cli.profile.clone()))
        .unwrap_or_else(|| DEFAULT_PROFILE.to_string());

    let rules = PropagationRules {
        instance_tags_to_propagate: file
            .instance_tags_to_propagate
            .unwrap_or_else(|| to_strings(DEFAULT_INSTANCE_TAGS)),
        volume_tags_to_propagate: file
            .volume_tags_to_propagate
            .unwrap_or_else(|| to_strings(DEFAULT_VOLUME_TAGS)),
        volume_tags_to_be_set: fixed_tags("_volume_tags_to_be_set", file.volume_tags_to_be_set)?,
        snapshot_tags_to_be_set: fixed_tags(
            "_snapshot_tags_to_be_set",
            file.snapshot_tags_to_be_set,
        )?,
        append: cli.append,
        dry_run: cli.dryrun,
    };

    let selection = ResourceSelection {
        volumes: non_empty_list(file.volumes_to_tag)
            .or_else(|| non_empty_list(Some(cli.volumes.clone()))),
        snapshots: non_empty_list(file.snapshots_to_tag)
            .or_else(|| non_empty_list(Some(cli.snapshots.clone()))),
        instance_filter: instance_filter(file.instance_filter),
        skip_volumes: cli.novolumes,
        skip_snapshots: cli.nosnapshots,
    };

    Ok(Settings {
        region,
        profile,
        rules,
        selection,
    })
}

fn fixed_tags(field: &'static str, tags: Option<Vec<FixedTag>>) -> Result<TagMap, ConfigError> {
    let mut map = TagMap::new();
    for tag in tags.unwrap_or_default() {
        let key = tag.key.trim();
        if key.is_empty() {
            return Err(ConfigError::InvalidTag {
                field,
                reason: "tag key must not be empty".to_string(),
            });
        }
        if key.to_ascii_lowercase().starts_with(RESERVED_TAG_PREFIX) {
            return Err(ConfigError::InvalidTag {
                field,
                reason: format!("tag key {key} uses the reserved {RESERVED_TAG_PREFIX} prefix"),
            });
        }
        map.insert(key.to_string(), tag.value);
    }
    Ok(map)
}

fn instance_filter(raw: Option<BTreeMap<String, FilterValues>>) -> Option<InstanceFilter> {
    let filter: InstanceFilter = raw?
        .into_iter()
        .map(|(name, values)| (name, values.into_vec()))
        .filter(|(_, values)| !values.is_empty())
        .collect();
    (!filter.is_empty()).then_some(filter)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn non_empty_list(values: Option<Vec<String>>) -> Option<Vec<String>> {
    values.filter(|values| !values.is_empty())
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
