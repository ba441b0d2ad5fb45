//! Shared test infrastructure for integration tests.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// AWS variables that would let a test run reach a real account.
const AWS_ENV: &[&str] = &[
    "AWS_REGION",
    "AWS_DEFAULT_REGION",
    "AWS_PROFILE",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_SHARED_CREDENTIALS_FILE",
    "RUST_LOG",
];

/// An isolated home directory to run the binary in.
///
/// The AWS environment is scrubbed so runs never pick up the developer's
/// credentials or region.
pub struct Sandbox {
    home: TempDir,
}

/// Exit status and captured streams of one run.
#[derive(Debug)]
pub struct RunOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for RunOutput {
    fn from(output: Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

impl Sandbox {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            home: TempDir::new()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.home.path()
    }

    /// Write `contents` to a file in the sandbox and return its path.
    pub fn write_file(&self, name: &str, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.home.path().join(name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Run the graffiti binary with `args`.
    pub fn run<I, S>(&self, args: I) -> anyhow::Result<RunOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(binary());
        command
            .args(args)
            .current_dir(self.home.path())
            .env("HOME", self.home.path());
        for name in AWS_ENV {
            command.env_remove(name);
        }
        Ok(command.output()?.into())
    }
}

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_graffiti"))
}
