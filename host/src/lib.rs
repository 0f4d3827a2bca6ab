//! HTTP surface and process wiring for the quill conversion service: the
//! command-line/config layer, the enqueue service the routes delegate to,
//! and the axum router itself.

pub mod error;
pub mod server;
pub mod service;

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use quill_core::QueueOpts;

use crate::error::HostResult;

fn default_address() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("temp/uploads")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("temp/results")
}

fn default_max_log() -> usize {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Default, Clone, Serialize, Deserialize, Debug, Parser)]
#[command(
    name = "quill",
    about = "Document to markdown conversion service",
    long_about = None
)]
#[serde(default)]
pub struct Cli {
    #[arg(long, require_equals = true, default_value = "0.0.0.0:8000")]
    #[serde(default = "default_address")]
    /// Server bind address
    /// [default: 0.0.0.0:8000]
    pub address: String,

    #[arg(long, require_equals = true, default_value = "data")]
    #[serde(default = "default_data_dir")]
    /// Directory holding the task database
    pub data_dir: PathBuf,

    #[arg(long, require_equals = true, default_value = "temp/uploads")]
    #[serde(default = "default_upload_dir")]
    /// Staging directory for uploaded documents
    pub upload_dir: PathBuf,

    #[arg(long, require_equals = true, default_value = "temp/results")]
    #[serde(default = "default_results_dir")]
    /// Directory for result archives
    pub results_dir: PathBuf,

    #[arg(long, require_equals = true)]
    /// Write daily-rotated JSON logs into this directory instead of stdout
    pub log_path: Option<PathBuf>,

    #[arg(long, require_equals = true, default_value = "7")]
    #[serde(default = "default_max_log")]
    pub max_log: usize,

    #[arg(long, require_equals = true, env = "RUST_LOG", default_value = "info")]
    #[serde(default = "default_log_level")]
    /// Set the log level
    pub log_level: String,

    #[arg(long, require_equals = true)]
    /// Path to a JSON config file with the same fields as these arguments.
    /// Command-line arguments take precedence over its contents
    pub config_path: Option<PathBuf>,

    #[command(flatten)]
    #[serde(flatten)]
    /// Queue engine options
    pub queue: QueueOpts,
}

impl Cli {
    /// Read the options from the config file and merge them with the
    /// current options, command line winning.
    pub fn merge_from_file(&mut self) -> HostResult<()> {
        let Some(config_path) = &self.config_path else {
            return Ok(());
        };
        let file = std::fs::File::open(config_path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Value = serde_json::from_reader(reader)?;
        let this = serde_json::to_value(&self)?;
        merge(&mut config, &this);

        *self = serde_json::from_value(config)?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("tasks.db")
    }
}

/// Merges two json's together, overwriting `a` with the values of `b`
fn merge(a: &mut Value, b: &Value) {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                merge(a.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (a, b) if !b.is_null() => *a = b.clone(),
        // If b is null, just keep a (which means do nothing).
        _ => {}
    }
}
