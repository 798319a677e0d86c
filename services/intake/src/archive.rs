use crate::storage_layout::{StorageError, StorageLayout, UserId};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, instrument, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Errors that can occur while building an archive
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("No photos stored for this scope")]
    Empty,

    #[error("Storage fault: none of the {listed} stored photos could be read")]
    Unreadable { listed: usize },

    #[error("Storage fault: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to package archive: {0}")]
    Packaging(#[from] zip::result::ZipError),

    #[error("Failed to write archive entry: {0}")]
    Io(#[from] std::io::Error),
}

/// Which photos go into an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveScope {
    User(UserId),
    AllUsers,
}

impl ArchiveScope {
    /// File name of the packaged archive
    pub fn file_name(&self) -> String {
        match self {
            ArchiveScope::User(user_id) => format!("photos_{}.zip", user_id),
            ArchiveScope::AllUsers => "party_photos.zip".to_string(),
        }
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            ArchiveScope::User(_) => "user",
            ArchiveScope::AllUsers => "all_users",
        }
    }
}

/// One archive entry with its bytes
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct PendingEntry {
    name: String,
    path: PathBuf,
}

/// Packaged archive and what went into it
#[derive(Debug)]
pub struct ArchiveReport {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub entries: usize,
    /// Listed photos that could not be read
    pub skipped: usize,
    /// Users whose namespace could not be listed
    pub skipped_users: usize,
    pub built_at: DateTime<Utc>,
}

impl ArchiveReport {
    pub fn is_partial(&self) -> bool {
        self.skipped > 0 || self.skipped_users > 0
    }
}

/// Builds archives from the committed photos in storage.
///
/// Takes no per-user lock: the listing only ever sees files that reached
/// their committed name, so a photo accepted mid-build is either fully in
/// the archive or not in it at all.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    layout: StorageLayout,
}

impl ArchiveBuilder {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Snapshot the entries of `scope`; bytes are read lazily
    #[instrument(skip(self))]
    pub async fn build(&self, scope: ArchiveScope) -> Result<ArchiveStream, ArchiveError> {
        let mut pending = VecDeque::new();
        let mut skipped_users = 0;

        match scope {
            ArchiveScope::User(user_id) => {
                for photo in self.layout.list_photos(user_id).await? {
                    pending.push_back(PendingEntry {
                        name: format!("{}.jpg", photo.sequence_number),
                        path: photo.path,
                    });
                }
            }
            ArchiveScope::AllUsers => {
                for user_id in self.layout.list_users().await? {
                    let photos = match self.layout.list_photos(user_id).await {
                        Ok(photos) => photos,
                        Err(e) => {
                            skipped_users += 1;
                            metrics::counter!("archive_entries_skipped_total").increment(1);
                            warn!(user_id = %user_id, error = %e, "Skipping unlistable namespace");
                            continue;
                        }
                    };
                    for photo in photos {
                        pending.push_back(PendingEntry {
                            name: format!("{}/{}.jpg", user_id, photo.sequence_number),
                            path: photo.path,
                        });
                    }
                }
            }
        }

        Ok(ArchiveStream {
            layout: self.layout.clone(),
            scope,
            listed: pending.len(),
            pending,
            read: 0,
            skipped: 0,
            skipped_users,
        })
    }
}

/// Lazy, single-pass sequence of archive entries
#[derive(Debug)]
pub struct ArchiveStream {
    layout: StorageLayout,
    scope: ArchiveScope,
    pending: VecDeque<PendingEntry>,
    listed: usize,
    read: usize,
    skipped: usize,
    skipped_users: usize,
}

impl ArchiveStream {
    pub fn scope(&self) -> ArchiveScope {
        self.scope
    }

    /// Entries found when the stream was built
    pub fn listed(&self) -> usize {
        self.listed
    }

    /// Entries that could not be read so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Namespaces left out because they could not be listed
    pub fn skipped_users(&self) -> usize {
        self.skipped_users
    }

    /// Next readable entry; unreadable ones are skipped
    pub async fn next_entry(&mut self) -> Option<ArchiveEntry> {
        while let Some(entry) = self.pending.pop_front() {
            match self.layout.read_photo(&entry.path).await {
                Ok(bytes) => {
                    self.read += 1;
                    return Some(ArchiveEntry {
                        name: entry.name,
                        bytes,
                    });
                }
                Err(e) => {
                    self.skipped += 1;
                    metrics::counter!("archive_entries_skipped_total").increment(1);
                    warn!(entry = %entry.name, error = %e, "Skipping unreadable archive entry");
                }
            }
        }
        None
    }

    /// Adapt into a `futures` stream
    pub fn into_stream(self) -> impl Stream<Item = ArchiveEntry> {
        stream::unfold(self, |mut archive| async move {
            archive.next_entry().await.map(|entry| (entry, archive))
        })
    }

    /// Package every readable entry into a ZIP container
    pub async fn into_zip(mut self) -> Result<ArchiveReport, ArchiveError> {
        if self.listed == 0 && self.skipped_users == 0 {
            return Err(ArchiveError::Empty);
        }

        // Photos are JPEG already; deflating them only costs CPU.
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

        while let Some(entry) = self.next_entry().await {
            writer.start_file(entry.name, options)?;
            writer.write_all(&entry.bytes)?;
        }

        if self.read == 0 {
            return Err(ArchiveError::Unreadable {
                listed: self.listed,
            });
        }

        let bytes = writer.finish()?.into_inner();
        metrics::counter!("archives_built_total", "scope" => self.scope.label()).increment(1);

        if self.skipped > 0 || self.skipped_users > 0 {
            warn!(
                scope = ?self.scope,
                entries = self.read,
                skipped = self.skipped,
                skipped_users = self.skipped_users,
                "Built partial archive"
            );
        } else {
            info!(scope = ?self.scope, entries = self.read, size_bytes = bytes.len(), "Built archive");
        }

        Ok(ArchiveReport {
            file_name: self.scope.file_name(),
            bytes,
            entries: self.read,
            skipped: self.skipped,
            skipped_users: self.skipped_users,
            built_at: Utc::now(),
        })
    }
}
