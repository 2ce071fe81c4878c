//! Fetch, parse, queue and upload
//!
//! The stages are independent and only meet at the [`WorkQueue`]; the
//! [`Coordinator`] wires them together.

pub mod coordinator;
pub mod format;
pub mod identifier;
pub mod parser;
pub mod queue;
pub mod record;
pub mod uploader;

pub use coordinator::{Coordinator, PipelineConfig};
pub use format::{FieldKind, FieldSpec, LogFormat};
pub use identifier::record_id;
pub use parser::{LineParser, ParseError, RecordStream};
pub use queue::{QueueClosed, WorkQueue};
pub use record::LogRecord;
pub use uploader::{UploadConfig, Uploader};
