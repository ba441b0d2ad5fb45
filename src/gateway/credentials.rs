//! AWS credential lookup.
//!
//! Sources, first match wins: the named profile in the shared credentials
//! file, the `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` environment pair,
//! then the `default` profile.
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub(crate) const DEFAULT_PROFILE: &str = "default";

#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("No AWS credentials found - check your credentials")]
    Missing,
    #[error("read credentials file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolve credentials for `profile` from the process environment.
pub(crate) fn resolve_credentials(profile: &str) -> Result<Credentials, CredentialsError> {
    let file = std::env::var_os("AWS_SHARED_CREDENTIALS_FILE")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".aws").join("credentials")));
    resolve_from(profile, |name| std::env::var(name).ok(), file.as_deref())
}

fn resolve_from(
    profile: &str,
    env: impl Fn(&str) -> Option<String>,
    credentials_file: Option<&Path>,
) -> Result<Credentials, CredentialsError> {
    let profiles = match credentials_file {
        Some(path) if path.is_file() => {
            let text = std::fs::read_to_string(path).map_err(|source| CredentialsError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            parse_profiles(&text)
        }
        _ => HashMap::new(),
    };

    if profile != DEFAULT_PROFILE {
        if let Some(credentials) = profiles.get(profile).and_then(from_profile) {
            tracing::debug!(profile, "using credentials from profile");
            return Ok(credentials);
        }
        tracing::warn!(profile, "profile not found, falling back to default credentials");
    }

    if let (Some(access_key_id), Some(secret_access_key)) =
        (env("AWS_ACCESS_KEY_ID"), env("AWS_SECRET_ACCESS_KEY"))
    {
        tracing::debug!("using credentials from environment");
        return Ok(Credentials {
            access_key_id,
            secret_access_key,
            session_token: env("AWS_SESSION_TOKEN").filter(|token| !token.is_empty()),
        });
    }

    profiles
        .get(DEFAULT_PROFILE)
        .and_then(from_profile)
        .ok_or(CredentialsError::Missing)
}

fn from_profile(entries: &HashMap<String, String>) -> Option<Credentials> {
    let access_key_id = entries.get("aws_access_key_id")?.clone();
    let secret_access_key = entries.get("aws_secret_access_key")?.clone();
    let session_token = entries
        .get("aws_session_token")
        .or_else(|| entries.get("aws_security_token"))
        .cloned();
    Some(Credentials {
        access_key_id,
        secret_access_key,
        session_token,
    })
}

/// Parse an INI-style credentials file into profile -> key -> value.
fn parse_profiles(text: &str) -> HashMap<String, HashMap<String, String>> {
    let mut profiles: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let name = section.trim();
            let name = name.strip_prefix("profile ").unwrap_or(name).trim();
            current = Some(name.to_string());
            profiles.entry(name.to_string()).or_default();
            continue;
        }
        let (Some(section), Some((key, value))) = (&current, line.split_once('=')) else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        profiles
            .entry(section.clone())
            .or_default()
            .insert(key.trim().to_ascii_lowercase(), value.to_string());
    }
    profiles
}
