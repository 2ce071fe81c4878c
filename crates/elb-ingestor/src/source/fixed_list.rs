//! Fixed-list backfill source
//!
//! Walks an operator-supplied list of key prefixes in one bucket. Objects are
//! never moved; progress lives in marker files under a work directory:
//!
//! ```text
//! work_dir/prefixes/<prefix>   prefix taken by a running ingestor
//! work_dir/claimed/<key>       object claimed (exclusive create)
//! work_dir/done/<key>          object fully processed
//! ```
//!
//! Names are the key with `%` and `/` percent-encoded, so every marker is a
//! flat file. A claimed object without a done marker was interrupted and is
//! released by [`SourceAdapter::recover`].

use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{FileState, LogFile, LogStream, SourceAdapter};
use crate::error::{IngestError, IngestResult};
use crate::storage::ObjectStore;

const PREFIX_LOCKS: &str = "prefixes";
const CLAIMED: &str = "claimed";
const DONE: &str = "done";

/// Listing position inside the target list
#[derive(Debug, Default)]
struct Cursor {
    next_target: usize,
    prefix: Option<String>,
    token: Option<String>,
}

pub struct FixedListSource {
    store: Arc<dyn ObjectStore>,
    targets: Vec<String>,
    work_dir: PathBuf,
    cursor: Mutex<Cursor>,
}

impl FixedListSource {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        targets: Vec<String>,
        work_dir: impl Into<PathBuf>,
    ) -> IngestResult<Self> {
        if targets.is_empty() {
            return Err(IngestError::Config(
                "Fixed list must name at least one prefix".to_string(),
            ));
        }

        Ok(Self {
            store,
            targets,
            work_dir: work_dir.into(),
            cursor: Mutex::new(Cursor::default()),
        })
    }

    /// Read target prefixes from a list file, one per line. Blank lines and
    /// lines starting with `#` are ignored.
    pub async fn load_targets(path: &Path) -> IngestResult<Vec<String>> {
        let contents = fs::read_to_string(path).await?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }

    pub async fn ensure_dirs(&self) -> IngestResult<()> {
        for dir in [PREFIX_LOCKS, CLAIMED, DONE] {
            fs::create_dir_all(self.work_dir.join(dir)).await?;
        }
        Ok(())
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    fn marker(&self, area: &str, key: &str) -> PathBuf {
        self.work_dir.join(area).join(marker_name(key))
    }

    /// Take the next target prefix no other ingestor holds.
    async fn take_next_prefix(&self, cursor: &mut Cursor) -> IngestResult<Option<String>> {
        while let Some(prefix) = self.targets.get(cursor.next_target) {
            match create_exclusive(&self.marker(PREFIX_LOCKS, prefix)).await {
                Ok(()) => {
                    cursor.next_target += 1;
                    info!(prefix = %prefix, "Taking backfill prefix");
                    return Ok(Some(prefix.clone()));
                },
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    cursor.next_target += 1;
                    debug!(prefix = %prefix, "Prefix held by another ingestor");
                },
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl SourceAdapter for FixedListSource {
    fn kind(&self) -> &'static str {
        "fixed_list"
    }

    #[instrument(skip(self))]
    async fn discover(&self, batch_size: usize) -> IngestResult<Vec<LogFile>> {
        let mut cursor = self.cursor.lock().await;
        let mut files = Vec::with_capacity(batch_size);

        while files.len() < batch_size {
            let prefix = match cursor.prefix.clone() {
                Some(prefix) => prefix,
                None => match self.take_next_prefix(&mut cursor).await? {
                    Some(prefix) => {
                        cursor.prefix = Some(prefix.clone());
                        prefix
                    },
                    None => break,
                },
            };

            let wanted = i32::try_from(batch_size - files.len()).unwrap_or(i32::MAX);
            let page = self
                .store
                .list(&prefix, Some(wanted), cursor.token.clone())
                .await?;

            for entry in page.entries {
                if entry.key.ends_with('/') {
                    continue;
                }
                if fs::try_exists(self.marker(CLAIMED, &entry.key)).await? {
                    continue;
                }
                files.push(LogFile::discovered(entry.key, entry.size));
            }

            match page.next_token {
                Some(next) => cursor.token = Some(next),
                None => {
                    debug!(prefix = %prefix, "Prefix fully listed");
                    cursor.prefix = None;
                    cursor.token = None;
                },
            }
        }

        debug!(found = files.len(), "Discovered backfill objects");
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

        let lock = self.marker(CLAIMED, &file.location);
        match create_exclusive(&lock).await {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(IngestError::ClaimConflict {
                    location: file.location.clone(),
                });
            },
            Err(e) => return Err(e.into()),
        }

        let stream = match self.store.open(&file.location).await {
            Ok(stream) => stream,
            Err(e) => {
                // Release the claim so the next run lists the object again.
                if let Err(remove) = fs::remove_file(&lock).await {
                    warn!(error = %remove, "Failed to release claim marker");
                }
                return Err(e.into());
            },
        };

        file.transition(FileState::Claimed)?;
        debug!("Claimed backfill object");
        Ok(stream)
    }

    #[instrument(skip(self, file), fields(file = %file.location))]
    async fn complete(&self, file: &mut LogFile) -> IngestResult<()> {
        if file.state == FileState::Done {
            return Ok(());
        }

        fs::write(self.marker(DONE, &file.location), Utc::now().to_rfc3339()).await?;
        file.transition(FileState::Done)?;
        debug!("Marked backfill object done");
        Ok(())
    }

    /// Drop interrupted claims and every prefix lock, so this run lists each
    /// target again. Finished objects keep their claim marker and are skipped.
    #[instrument(skip(self))]
    async fn recover(&self) -> IngestResult<usize> {
        let mut released = 0;

        let mut claims = fs::read_dir(self.work_dir.join(CLAIMED)).await?;
        while let Some(entry) = claims.next_entry().await? {
            if fs::try_exists(self.work_dir.join(DONE).join(entry.file_name())).await? {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => released += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {},
                Err(e) => return Err(e.into()),
            }
        }

        let mut locks = fs::read_dir(self.work_dir.join(PREFIX_LOCKS)).await?;
        while let Some(entry) = locks.next_entry().await? {
            match fs::remove_file(entry.path()).await {
                Ok(()) => {},
                Err(e) if e.kind() == ErrorKind::NotFound => {},
                Err(e) => return Err(e.into()),
            }
        }

        *self.cursor.lock().await = Cursor::default();

        if released > 0 {
            info!(released, "Released interrupted backfill claims");
        }
        Ok(released)
    }
}

async fn create_exclusive(path: &Path) -> std::io::Result<()> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map(drop)
}

/// Flat file name for an object key or prefix.
fn marker_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for (i, c) in key.chars().enumerate() {
        match c {
            '%' => name.push_str("%25"),
            '/' => name.push_str("%2F"),
            '.' if i == 0 => name.push_str("%2E"),
            _ => name.push(c),
        }
    }
    name
}
