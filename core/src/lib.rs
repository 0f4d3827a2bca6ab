//! Domain layer of the quill conversion service: typed configuration, the
//! closed error taxonomy, converter capabilities and their dispatch table,
//! result packaging, content hashing, and the publisher contract.
//!
//! Nothing in this crate touches the task database directly; workers and the
//! HTTP surface compose these pieces around [`quill_taskdb::TaskDb`].

pub mod config;
pub mod convert;
pub mod error;
pub mod files;
pub mod package;
pub mod publish;

pub use config::QueueOpts;
pub use convert::{Conversion, Converter, Converters};
pub use error::{Error, Result};
pub use publish::ResultPublisher;
