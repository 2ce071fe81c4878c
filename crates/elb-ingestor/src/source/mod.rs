//! Log file sources
//!
//! A source owns the physical lifecycle of log files:
//!
//! ```text
//! input area ──claim──▶ processing area ──complete──▶ done area
//!  Discovered             Claimed                      Done
//! ```
//!
//! The relocation *is* the state transition, so nothing else is persisted. A
//! crash leaves files in the processing area, and [`SourceAdapter::recover`]
//! returns them to the input area on the next start.
//!
//! Three backends implement [`SourceAdapter`]: [`LocalSource`] (three
//! directories on one filesystem), [`ObjectStoreSource`] (three key
//! prefixes in one bucket) and [`FixedListSource`] (a backfill over listed
//! prefixes that tracks progress with marker files instead of moving
//! objects). [`SourceBackend`] picks one at startup.

use async_trait::async_trait;
use std::fmt;
use tokio::io::AsyncBufRead;

use crate::error::{IngestError, IngestResult};

pub mod fixed_list;
pub mod local;
pub mod object_store;

pub use fixed_list::FixedListSource;
pub use local::LocalSource;
pub use object_store::{ObjectStoreSource, Prefixes};

/// Byte stream of a claimed file, read line by line by the parser.
pub type LogStream = Box<dyn AsyncBufRead + Send + Unpin>;

/// Lifecycle state of a log file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Discovered,
    Claimed,
    Done,
}

impl FileState {
    pub fn as_str(&self) -> &str {
        match self {
            FileState::Discovered => "discovered",
            FileState::Claimed => "claimed",
            FileState::Done => "done",
        }
    }

    /// Allowed forward transitions. `Done` is terminal.
    pub fn can_transition_to(self, next: FileState) -> bool {
        matches!(
            (self, next),
            (FileState::Discovered, FileState::Claimed) | (FileState::Claimed, FileState::Done)
        )
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discoverable unit of work.
///
/// `location` is relative to the source's areas: a file name for the local
/// source, the key suffix after the lifecycle prefix for the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub location: String,
    pub state: FileState,
    pub size: u64,
}

impl LogFile {
    pub fn discovered(location: impl Into<String>, size: u64) -> Self {
        Self {
            location: location.into(),
            state: FileState::Discovered,
            size,
        }
    }

    pub fn transition(&mut self, next: FileState) -> IngestResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(IngestError::InvalidTransition {
                location: self.location.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Capability set shared by every source backend.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Short name for logs and the health endpoint
    fn kind(&self) -> &'static str;

    /// Up to `batch_size` files from the input area, ordered by location.
    /// Never returns a file that is already claimed.
    async fn discover(&self, batch_size: usize) -> IngestResult<Vec<LogFile>>;

    /// Move the file into the processing area and open it.
    ///
    /// Returns [`IngestError::ClaimConflict`] when another actor moved it first.
    async fn claim(&self, file: &mut LogFile) -> IngestResult<LogStream>;

    /// Move a claimed file into the done area. Safe to repeat.
    async fn complete(&self, file: &mut LogFile) -> IngestResult<()>;

    /// Return every file left in the processing area to the input area.
    /// Called once at startup; returns the number of files recovered.
    async fn recover(&self) -> IngestResult<usize>;
}

/// Source selected by configuration
pub enum SourceBackend {
    Local(LocalSource),
    ObjectStore(ObjectStoreSource),
    FixedList(FixedListSource),
}

#[async_trait]
impl SourceAdapter for SourceBackend {
    fn kind(&self) -> &'static str {
        match self {
            SourceBackend::Local(s) => s.kind(),
            SourceBackend::ObjectStore(s) => s.kind(),
            SourceBackend::FixedList(s) => s.kind(),
        }
    }

    async fn discover(&self, batch_size: usize) -> IngestResult<Vec<LogFile>> {
        match self {
            SourceBackend::Local(s) => s.discover(batch_size).await,
            SourceBackend::ObjectStore(s) => s.discover(batch_size).await,
            SourceBackend::FixedList(s) => s.discover(batch_size).await,
        }
    }

    async fn claim(&self, file: &mut LogFile) -> IngestResult<LogStream> {
        match self {
            SourceBackend::Local(s) => s.claim(file).await,
            SourceBackend::ObjectStore(s) => s.claim(file).await,
            SourceBackend::FixedList(s) => s.claim(file).await,
        }
    }

    async fn complete(&self, file: &mut LogFile) -> IngestResult<()> {
        match self {
            SourceBackend::Local(s) => s.complete(file).await,
            SourceBackend::ObjectStore(s) => s.complete(file).await,
            SourceBackend::FixedList(s) => s.complete(file).await,
        }
    }

    async fn recover(&self) -> IngestResult<usize> {
        match self {
            SourceBackend::Local(s) => s.recover().await,
            SourceBackend::ObjectStore(s) => s.recover().await,
            SourceBackend::FixedList(s) => s.recover().await,
        }
    }
}
