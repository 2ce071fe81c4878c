//! Object-store source
//!
//! One bucket, three key prefixes. S3 has no rename, so every relocation is a
//! copy followed by a delete of the original. A claim whose copy finds the
//! source key gone lost the race to another ingestor.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::{FileState, LogFile, LogStream, SourceAdapter};
use crate::error::{IngestError, IngestResult};
use crate::storage::ObjectStore;

/// The three lifecycle prefixes inside the bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefixes {
    pub search: String,
    pub working: String,
    pub done: String,
}

impl Prefixes {
    pub fn new(
        search: impl Into<String>,
        working: impl Into<String>,
        done: impl Into<String>,
    ) -> Self {
        Self {
            search: search.into(),
            working: working.into(),
            done: done.into(),
        }
    }

    /// Each prefix must be non-empty and must not contain another,
    /// otherwise listing the search prefix would also return claimed keys.
    pub fn validate(&self) -> IngestResult<()> {
        let all = [&self.search, &self.working, &self.done];
        for prefix in all {
            if prefix.is_empty() {
                return Err(IngestError::Config(
                    "Object store prefixes must not be empty".to_string(),
                ));
            }
        }
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                if i != j && b.starts_with(a.as_str()) {
                    return Err(IngestError::Config(format!(
                        "Prefix '{}' overlaps prefix '{}'",
                        a, b
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Swap the leading `from` prefix of `key` for `to`, exactly once.
pub fn replace_prefix(key: &str, from: &str, to: &str) -> IngestResult<String> {
    match key.strip_prefix(from) {
        Some(rest) => Ok(format!("{}{}", to, rest)),
        None => Err(IngestError::InvalidLocation {
            location: key.to_string(),
            prefix: from.to_string(),
        }),
    }
}

pub struct ObjectStoreSource {
    store: Arc<dyn ObjectStore>,
    prefixes: Prefixes,
}

impl ObjectStoreSource {
    pub fn new(store: Arc<dyn ObjectStore>, prefixes: Prefixes) -> IngestResult<Self> {
        prefixes.validate()?;
        Ok(Self { store, prefixes })
    }

    pub fn prefixes(&self) -> &Prefixes {
        &self.prefixes
    }

    fn key(prefix: &str, location: &str) -> String {
        format!("{}{}", prefix, location)
    }

    /// Copy then delete. A missing source surfaces as `StorageError::NotFound`.
    async fn relocate(&self, from: &str, to: &str) -> IngestResult<()> {
        self.store.copy(from, to).await?;
        self.store.delete(from).await?;
        debug!(from, to, "Relocated object");
        Ok(())
    }

    fn location_of(&self, key: &str, prefix: &str) -> IngestResult<String> {
        replace_prefix(key, prefix, "")
    }
}

#[async_trait]
impl SourceAdapter for ObjectStoreSource {
    fn kind(&self) -> &'static str {
        "object_store"
    }

    #[instrument(skip(self))]
    async fn discover(&self, batch_size: usize) -> IngestResult<Vec<LogFile>> {
        let mut files = Vec::with_capacity(batch_size);
        let mut token = None;

        // Folder markers take listing slots, so keep paging until the batch is full.
        while files.len() < batch_size {
            let wanted = i32::try_from(batch_size - files.len()).unwrap_or(i32::MAX);
            let page = self
                .store
                .list(&self.prefixes.search, Some(wanted), token)
                .await?;

            for entry in page.entries {
                if entry.key.ends_with('/') {
                    continue;
                }
                let location = self.location_of(&entry.key, &self.prefixes.search)?;
                files.push(LogFile::discovered(location, entry.size));
            }

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        files.sort_by(|a, b| a.location.cmp(&b.location));
        files.truncate(batch_size);
        debug!(found = files.len(), "Discovered objects");
        Ok(files)
    }

    #[instrument(skip(self, file), fields(file = %file.location))]
    async fn claim(&self, file: &mut LogFile) -> IngestResult<LogStream> {
        if !file.state.can_transition_to(FileState::Claimed) {
            return Err(IngestError::InvalidTransition {
                location: file.location.clone(),
                from: file.state,
                to: FileState::Claimed,
            });
        }

        let from = Self::key(&self.prefixes.search, &file.location);
        let to = replace_prefix(&from, &self.prefixes.search, &self.prefixes.working)?;

        match self.relocate(&from, &to).await {
            Ok(()) => {},
            Err(IngestError::Storage(e)) if e.is_not_found() => {
                return Err(IngestError::ClaimConflict {
                    location: file.location.clone(),
                });
            },
            Err(e) => return Err(e),
        }

        let stream = match self.store.open(&to).await {
            Ok(stream) => stream,
            Err(e) => {
                // Hand the object back so it does not wait in the working
                // prefix for the next restart.
                if let Err(undo) = self.relocate(&to, &from).await {
                    warn!(key = %to, error = %undo, "Failed to return unreadable object to search prefix");
                }
                return Err(e.into());
            },
        };
        file.transition(FileState::Claimed)?;
        debug!(key = %to, "Claimed object");
        Ok(stream)
    }

    #[instrument(skip(self, file), fields(file = %file.location))]
    async fn complete(&self, file: &mut LogFile) -> IngestResult<()> {
        if file.state == FileState::Done {
            return Ok(());
        }

        let from = Self::key(&self.prefixes.working, &file.location);
        let to = replace_prefix(&from, &self.prefixes.working, &self.prefixes.done)?;

        match self.relocate(&from, &to).await {
            Ok(()) => {},
            Err(IngestError::Storage(e)) if e.is_not_found() => {
                if !self.store.exists(&to).await? {
                    return Err(e.into());
                }
                debug!("Object already in done prefix");
            },
            Err(e) => return Err(e),
        }

        file.transition(FileState::Done)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recover(&self) -> IngestResult<usize> {
        let mut recovered = 0;
        let mut token = None;

        loop {
            let page = self.store.list(&self.prefixes.working, None, token).await?;

            for entry in page.entries {
                if entry.key.ends_with('/') {
                    continue;
                }
                let to = replace_prefix(&entry.key, &self.prefixes.working, &self.prefixes.search)?;
                match self.relocate(&entry.key, &to).await {
                    Ok(()) => recovered += 1,
                    Err(IngestError::Storage(e)) if e.is_not_found() => {
                        warn!(key = %entry.key, "Working object vanished during recovery");
                    },
                    Err(e) => return Err(e),
                }
            }

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        if recovered > 0 {
            info!(recovered, "Returned interrupted objects to the search prefix");
        }
        Ok(recovered)
    }
}
