//! The upload gateway directory.
//!
//! During a temporary unlock the file dialog is re-enabled, and the single
//! approved file is exposed in a dedicated folder. The folder is cleared
//! before each grant and purged when the grant lapses.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::error::UnlockError;

/// Name of the gateway folder under the public profile.
pub const GATEWAY_DIR_NAME: &str = "SecureUploadGateway";

/// Default gateway location: `%Public%\SecureUploadGateway`.
pub fn default_gateway_dir() -> PathBuf {
    let public = std::env::var_os("Public")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Users\Public"));
    public.join(GATEWAY_DIR_NAME)
}

/// An outstanding temporary unlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockGrant {
    /// SHA-256 of the exposed file.
    pub file_hash: String,
    /// Path of the copy inside the gateway.
    pub gateway_path: PathBuf,
    /// When the grant was issued.
    pub created_at: DateTime<Utc>,
    /// When the grant lapses.
    pub expires_at: DateTime<Utc>,
}

impl UnlockGrant {
    /// Whether the grant has lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Lowercase hex SHA-256 of a file's contents.
pub async fn file_sha256(path: &Path) -> Result<String, UnlockError> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|source| UnlockError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(hex::encode(Sha256::digest(&data)))
}

/// The gateway folder.
#[derive(Debug, Clone)]
pub struct Gateway {
    dir: PathBuf,
}

impl Gateway {
    /// A gateway rooted at `dir`. Nothing is created until [`Gateway::expose`].
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Gateway folder path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Clear the gateway and copy `source` into it.
    ///
    /// Returns the path of the copy. On failure the gateway is removed, so no
    /// partial folder is left behind.
    pub async fn expose(&self, source: &Path) -> Result<PathBuf, UnlockError> {
        let file_name = source
            .file_name()
            .ok_or_else(|| UnlockError::NotAFile(source.to_path_buf()))?;
        let target = self.dir.join(file_name);

        let result = async {
            self.remove_dir().await?;
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|source| UnlockError::Gateway {
                    path: self.dir.clone(),
                    source,
                })?;
            tokio::fs::copy(source, &target)
                .await
                .map_err(|source| UnlockError::Gateway {
                    path: target.clone(),
                    source,
                })?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            if let Err(cleanup) = self.remove_dir().await {
                warn!("Failed to remove partial gateway: {}", cleanup);
            }
            return Err(e);
        }

        debug!("Exposed {} in {}", source.display(), self.dir.display());
        Ok(target)
    }

    /// Delete the gateway folder and everything in it.
    pub async fn purge(&self) -> Result<(), UnlockError> {
        self.remove_dir().await
    }

    /// Whether the gateway holds no files (or does not exist).
    pub async fn is_empty(&self) -> bool {
        match tokio::fs::read_dir(&self.dir).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
            Err(_) => true,
        }
    }

    async fn remove_dir(&self) -> Result<(), UnlockError> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(UnlockError::Gateway {
                path: self.dir.clone(),
                source,
            }),
        }
    }
}
