// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The pluggable storage-client trait.

use async_trait::async_trait;

use crate::fs::{DirectoryInfo, FileInfo};

/// Errors surfaced by storage clients.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The addressed disk is not served by this client.
    #[error("disk '{0}' does not exist")]
    UnknownDisk(String),

    /// The addressed object does not exist.
    #[error("object '{0}' was not found")]
    NotFound(String),

    /// A filesystem operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An object-store operation failed.
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),

    /// Any other client failure.
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// Whether the error means "the object does not exist" rather than an
    /// operational failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(error) => error.kind() == std::io::ErrorKind::NotFound,
            Self::ObjectStore(error) => {
                matches!(error, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

/// A pluggable storage back-end.
///
/// Clients are shared across refresh passes; the engine never issues
/// concurrent calls to the same client.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Enumerates the disks served by this client.
    async fn disk_names(&self) -> Result<Vec<String>, StorageError>;

    /// Lists the directory tree of `disk` down to `max_depth` levels below
    /// the root. Side-car `.stat` attributes are already applied and the
    /// side-car files themselves are not reported.
    async fn scan_disk(&self, disk: &str, max_depth: u32)
        -> Result<DirectoryInfo, StorageError>;

    /// Reads one object in full.
    async fn read(&self, disk: &str, file: &FileInfo) -> Result<Vec<u8>, StorageError>;

    /// Deletes one object.
    async fn delete(&self, disk: &str, file: &FileInfo) -> Result<(), StorageError>;
}
