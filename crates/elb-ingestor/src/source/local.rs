//! Local-directory source
//!
//! Files move between three directories by `rename`, which is atomic on a
//! single filesystem. Two ingestors racing for the same file both call
//! `rename`; the loser sees `NotFound` and reports a claim conflict.
//!
//! Completed files are truncated, not deleted, so the processed directory
//! keeps a zero-length marker for every file that went through.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::BufReader;
use tracing::{debug, info, instrument, warn};

use super::{FileState, LogFile, LogStream, SourceAdapter};
use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone)]
pub struct LocalSource {
    input_dir: PathBuf,
    processing_dir: PathBuf,
    processed_dir: PathBuf,
}

impl LocalSource {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        processing_dir: impl Into<PathBuf>,
        processed_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            processing_dir: processing_dir.into(),
            processed_dir: processed_dir.into(),
        }
    }

    /// Create the three directories if they do not exist yet.
    pub async fn ensure_dirs(&self) -> IngestResult<()> {
        for dir in [&self.input_dir, &self.processing_dir, &self.processed_dir] {
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn processing_dir(&self) -> &Path {
        &self.processing_dir
    }

    pub fn processed_dir(&self) -> &Path {
        &self.processed_dir
    }

    /// Regular, non-hidden files in `dir`, sorted by name.
    async fn list_files(dir: &Path) -> IngestResult<Vec<LogFile>> {
        let mut entries = fs::read_dir(dir).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                warn!(path = %entry.path().display(), "Skipping file with non UTF-8 name");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Raced with another ingestor's rename.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }
            files.push(LogFile::discovered(name, metadata.len()));
        }

        files.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(files)
    }
}

#[async_trait]
impl SourceAdapter for LocalSource {
    fn kind(&self) -> &'static str {
        "local_file"
    }

    #[instrument(skip(self))]
    async fn discover(&self, batch_size: usize) -> IngestResult<Vec<LogFile>> {
        let mut files = Self::list_files(&self.input_dir).await?;
        files.truncate(batch_size);
        debug!(found = files.len(), "Discovered local files");
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

        let from = self.input_dir.join(&file.location);
        let to = self.processing_dir.join(&file.location);

        match fs::rename(&from, &to).await {
            Ok(()) => {},
            // Only a vanished input file is a lost race; a missing
            // processing directory is a broken source.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if !is_dir(&self.processing_dir).await? {
                    return Err(e.into());
                }
                return Err(IngestError::ClaimConflict {
                    location: file.location.clone(),
                });
            },
            Err(e) => return Err(e.into()),
        }

        let handle = match fs::File::open(&to).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(undo) = fs::rename(&to, &from).await {
                    warn!(error = %undo, "Failed to return unreadable file to the input directory");
                }
                return Err(e.into());
            },
        };
        file.transition(FileState::Claimed)?;
        debug!("Claimed local file");

        Ok(Box::new(BufReader::new(handle)))
    }

    #[instrument(skip(self, file), fields(file = %file.location))]
    async fn complete(&self, file: &mut LogFile) -> IngestResult<()> {
        if file.state == FileState::Done {
            return Ok(());
        }

        let from = self.processing_dir.join(&file.location);
        let to = self.processed_dir.join(&file.location);

        match fs::rename(&from, &to).await {
            Ok(()) => {},
            // A previous attempt already moved it; only the truncate may be missing.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if !fs::try_exists(&to).await? {
                    return Err(e.into());
                }
            },
            Err(e) => return Err(e.into()),
        }

        let handle = fs::OpenOptions::new().write(true).open(&to).await?;
        handle.set_len(0).await?;

        file.transition(FileState::Done)?;
        debug!("Completed local file");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recover(&self) -> IngestResult<usize> {
        let stranded = Self::list_files(&self.processing_dir).await?;
        let mut recovered = 0;

        for file in stranded {
            let from = self.processing_dir.join(&file.location);
            let to = self.input_dir.join(&file.location);
            match fs::rename(&from, &to).await {
                Ok(()) => recovered += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if recovered > 0 {
            info!(recovered, "Returned interrupted files to the input directory");
        }
        Ok(recovered)
    }
}

async fn is_dir(path: &Path) -> IngestResult<bool> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.is_dir()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
