use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Extension of every committed photo
const PHOTO_EXTENSION: &str = "jpg";

/// Prefix of in-flight writes; never matches the committed naming scheme
const PARTIAL_PREFIX: &str = ".partial-";

/// Stable identifier of a bot user (the Telegram user id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by the on-disk layout
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create namespace {path}: {source}")]
    Namespace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to list {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write photo {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Refusing to overwrite committed photo {0}")]
    AlreadyExists(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A committed photo found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPhoto {
    pub user_id: UserId,
    pub sequence_number: u32,
    pub path: PathBuf,
}

/// Summary of a namespace listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NamespaceScan {
    /// Committed photos present
    pub count: u32,
    /// Highest committed sequence number, 0 when empty
    pub highest: u32,
}

impl NamespaceScan {
    /// Photos were removed from the middle of the sequence
    pub fn has_gaps(&self) -> bool {
        self.highest != self.count
    }
}

/// Maps users to namespace directories and photos to file paths.
///
/// Layout: `{root}/{user_id}/{sequence_number}.jpg`. The directory listing is
/// the only index; a file only gets its committed name through an atomic
/// rename, so listings never observe a partially written photo.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by a single user
    pub fn namespace(&self, user_id: UserId) -> PathBuf {
        self.root.join(user_id.to_string())
    }

    /// Committed location of a user's photo
    pub fn path_for(&self, user_id: UserId, sequence_number: u32) -> PathBuf {
        self.namespace(user_id)
            .join(format!("{}.{}", sequence_number, PHOTO_EXTENSION))
    }

    /// Create the user's namespace if it does not exist yet
    pub async fn ensure_namespace(&self, user_id: UserId) -> Result<PathBuf, StorageError> {
        let path = self.namespace(user_id);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| StorageError::Namespace {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Number of committed photos in the user's namespace
    pub async fn count_existing(&self, user_id: UserId) -> Result<u32, StorageError> {
        Ok(self.scan_namespace(user_id).await?.count)
    }

    /// Count and highest sequence number of the user's committed photos
    pub async fn scan_namespace(&self, user_id: UserId) -> Result<NamespaceScan, StorageError> {
        let photos = self.list_photos(user_id).await?;
        let scan = NamespaceScan {
            count: photos.len() as u32,
            highest: photos.last().map_or(0, |p| p.sequence_number),
        };

        if scan.has_gaps() {
            warn!(
                user_id = %user_id,
                count = scan.count,
                highest = scan.highest,
                "Photo sequence in namespace is not contiguous"
            );
        }

        Ok(scan)
    }

    /// Committed photos of one user, ordered by sequence number
    pub async fn list_photos(&self, user_id: UserId) -> Result<Vec<StoredPhoto>, StorageError> {
        let dir = self.namespace(user_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StorageError::List { path: dir, source }),
        };

        let mut photos = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => return Err(StorageError::List { path: dir, source }),
            };

            let Some(sequence_number) = entry.file_name().to_str().and_then(parse_sequence_number)
            else {
                continue;
            };

            match entry.file_type().await {
                Ok(file_type) if file_type.is_file() => photos.push(StoredPhoto {
                    user_id,
                    sequence_number,
                    path: entry.path(),
                }),
                _ => continue,
            }
        }

        photos.sort_by_key(|p| p.sequence_number);
        Ok(photos)
    }

    /// Users that own a namespace, ordered by id
    pub async fn list_users(&self) -> Result<Vec<UserId>, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::List {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut users = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(StorageError::List {
                        path: self.root.clone(),
                        source,
                    })
                }
            };

            let Some(user_id) = entry.file_name().to_str().and_then(parse_user_id) else {
                continue;
            };

            // Links are kept; their target is checked when the namespace is listed.
            if matches!(entry.file_type().await, Ok(t) if t.is_dir() || t.is_symlink()) {
                users.push(user_id);
            }
        }

        users.sort();
        Ok(users)
    }

    /// Remove temporary files left behind by an interrupted write
    pub async fn sweep_partial(&self, user_id: UserId) -> Result<usize, StorageError> {
        let dir = self.namespace(user_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(StorageError::List { path: dir, source }),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StorageError::List {
                path: dir.clone(),
                source,
            })?
        {
            let is_partial = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(PARTIAL_PREFIX));
            if !is_partial {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    path = %entry.path().display(),
                    error = %e,
                    "Failed to remove partial photo"
                ),
            }
        }

        if removed > 0 {
            debug!(user_id = %user_id, removed = removed, "Swept partial photos");
        }

        Ok(removed)
    }

    /// Write a photo under its committed name.
    ///
    /// Blocking: the bytes go to a temporary file in the namespace, are synced,
    /// and only then renamed into place. An existing committed file is never
    /// replaced.
    pub fn write_photo(
        &self,
        user_id: UserId,
        sequence_number: u32,
        bytes: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let target = self.path_for(user_id, sequence_number);
        if fs::symlink_metadata(&target).is_ok() {
            return Err(StorageError::AlreadyExists(target));
        }

        let partial = self.namespace(user_id).join(format!(
            "{}{}-{}",
            PARTIAL_PREFIX,
            sequence_number,
            Uuid::new_v4().simple()
        ));

        let written = (|| -> io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&partial)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&partial, &target)
        })();

        if let Err(source) = written {
            let _ = fs::remove_file(&partial);
            return Err(StorageError::Write {
                path: target,
                source,
            });
        }

        // Persist the rename itself; not all platforms allow syncing a directory.
        if let Ok(dir) = File::open(self.namespace(user_id)) {
            let _ = dir.sync_all();
        }

        Ok(target)
    }

    pub async fn read_photo(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        tokio::fs::read(path)
            .await
            .map_err(|source| StorageError::Read {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Check that the storage root accepts writes
    pub async fn check_writable(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::Namespace {
                path: self.root.clone(),
                source,
            })?;

        let marker = self
            .root
            .join(format!("{}ready-{}", PARTIAL_PREFIX, Uuid::new_v4().simple()));
        tokio::fs::write(&marker, b"ok")
            .await
            .map_err(|source| StorageError::Write {
                path: marker.clone(),
                source,
            })?;
        let _ = tokio::fs::remove_file(&marker).await;
        Ok(())
    }
}

/// `"12.jpg"` -> 12; anything else (temp files, `"01.jpg"`, `"0.jpg"`) -> None
fn parse_sequence_number(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(PHOTO_EXTENSION)?.strip_suffix('.')?;
    if stem.is_empty() || stem.starts_with('0') || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn parse_user_id(name: &str) -> Option<UserId> {
    let id: i64 = name.parse().ok()?;
    // Only the canonical decimal form maps back to the same namespace.
    (id.to_string() == name).then_some(UserId(id))
}
