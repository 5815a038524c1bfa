//! Store cluster configuration.
//!
//! The config file is the structured text form of the cluster layout: a list
//! of store servers and an optional retention policy. The storage core only
//! consumes two things from it — this server's identity and its merger
//! target size — but the whole document is parsed so a bad file fails
//! loudly at startup.

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tokio::fs;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("error reading config file {}: {}", path.display(), source))]
    Read { path: PathBuf, source: io::Error },

    #[snafu(display("error parsing config file {}: {}", path.display(), source))]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    #[default]
    Unknown,
    Starting,
    Loading,
    Running,
    Readonly,
    Draining,
    Lameduck,
    Shutdown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreServer {
    pub address: String,
    #[serde(default)]
    pub state: ServerState,
    /// Merge small indexed files up to this many bytes on this server.
    /// Merging is disabled when absent.
    #[serde(default)]
    pub target_indexed_file_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionTarget {
    Keep,
    Drop,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionPolicyItem {
    #[serde(default)]
    pub variable: Vec<String>,
    #[serde(default)]
    pub comment: Vec<String>,
    pub policy: RetentionTarget,
    #[serde(default)]
    pub min_age: u64,
    #[serde(default)]
    pub max_age: u64,
}

fn default_retention_interval() -> u32 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub policy: Vec<RetentionPolicyItem>,
    #[serde(default = "default_retention_interval")]
    pub interval: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub server: Vec<StoreServer>,
    #[serde(default)]
    pub retention_policy: Option<RetentionPolicy>,
}

impl StoreConfig {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<StoreConfig, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .context(ReadSnafu { path: path.to_path_buf() })?;
        parse(&text).context(ParseSnafu { path: path.to_path_buf() })
    }

    pub fn server(&self, address: &str) -> Option<&StoreServer> {
        self.server.iter().find(|server| server.address == address)
    }

    /// The merger target size for the server at `address`, if one is
    /// configured.
    pub fn target_indexed_file_size(&self, address: &str) -> Option<u64> {
        self.server(address)
            .and_then(|server| server.target_indexed_file_size)
    }
}

fn parse(text: &str) -> Result<StoreConfig, serde_yaml::Error> {
    serde_yaml::from_str(text)
}
