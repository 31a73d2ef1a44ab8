// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! A deterministic in-memory storage client for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::client::{StorageClient, StorageError};
use crate::dotstat::{self, DotStat};
use crate::fs::{DirectoryInfo, FileInfo, TreeNode};

/// One object held by the [`MemoryClient`].
#[derive(Debug, Clone)]
pub struct MemoryFile {
    /// The object contents.
    pub bytes: Vec<u8>,
    /// Creation timestamp.
    pub born_at: DateTime<Utc>,
    /// Modification timestamp.
    pub modified_at: DateTime<Utc>,
    /// Archival timestamp.
    pub archived_at: DateTime<Utc>,
}

impl MemoryFile {
    /// An object whose three timestamps all equal `instant`.
    pub fn at(bytes: impl Into<Vec<u8>>, instant: DateTime<Utc>) -> Self {
        Self {
            bytes: bytes.into(),
            born_at: instant,
            modified_at: instant,
            archived_at: instant,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    disks: BTreeMap<String, BTreeMap<String, MemoryFile>>,
    fail_listing: bool,
    fail_deletes: HashSet<(String, String)>,
    deleted: Vec<String>,
}

/// In-memory [`StorageClient`] with injectable failures.
#[derive(Debug, Default)]
pub struct MemoryClient {
    inner: Mutex<Inner>,
}

impl MemoryClient {
    /// Creates an empty client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty disk.
    pub fn add_disk(&self, name: &str) {
        self.lock().disks.entry(name.to_owned()).or_default();
    }

    /// Removes a disk and everything on it.
    pub fn remove_disk(&self, name: &str) {
        self.lock().disks.remove(name);
    }

    /// Stores an object under `path` (segments separated by `/`).
    pub fn put(&self, disk: &str, path: &str, file: MemoryFile) {
        self.lock()
            .disks
            .entry(disk.to_owned())
            .or_default()
            .insert(path.to_owned(), file);
    }

    /// Removes an object.
    pub fn remove(&self, disk: &str, path: &str) {
        if let Some(files) = self.lock().disks.get_mut(disk) {
            files.remove(path);
        }
    }

    /// Makes every subsequent `disk_names` call fail until reset.
    pub fn set_fail_listing(&self, fail: bool) {
        self.lock().fail_listing = fail;
    }

    /// Makes deletion of the given object fail.
    pub fn fail_delete(&self, disk: &str, path: &str) {
        self.lock()
            .fail_deletes
            .insert((disk.to_owned(), path.to_owned()));
    }

    /// The paths deleted so far, as `disk/path`, in deletion order.
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory client lock is never poisoned")
    }
}

#[async_trait]
impl StorageClient for MemoryClient {
    async fn disk_names(&self) -> Result<Vec<String>, StorageError> {
        let inner = self.lock();
        if inner.fail_listing {
            return Err(StorageError::Other("listing failure injected".to_owned()));
        }
        Ok(inner.disks.keys().cloned().collect())
    }

    async fn scan_disk(
        &self,
        disk: &str,
        max_depth: u32,
    ) -> Result<DirectoryInfo, StorageError> {
        let inner = self.lock();
        let files = inner
            .disks
            .get(disk)
            .ok_or_else(|| StorageError::UnknownDisk(disk.to_owned()))?;

        let mut tree = TreeNode::default();
        let mut overrides: HashMap<String, DotStat> = HashMap::new();

        for (path, file) in files {
            let segments: Vec<String> = path.split('/').map(str::to_owned).collect();
            let Some((name, dirs)) = segments.split_last() else {
                continue;
            };
            if dirs.len() > max_depth as usize {
                continue;
            }

            if dotstat::is_stat_file(name) {
                match DotStat::parse(&file.bytes) {
                    Ok(stat) => {
                        overrides.insert(dotstat::target_path(path).to_owned(), stat);
                    }
                    Err(error) => {
                        tracing::warn!(stat_file = %path, %error, "could not parse stat file");
                    }
                }
                continue;
            }

            tree.insert(
                dirs,
                FileInfo {
                    name: name.clone(),
                    parent: dirs.join("/"),
                    size: file.bytes.len() as u64,
                    born_at: file.born_at,
                    modified_at: file.modified_at,
                    archived_at: file.archived_at,
                },
            );
        }

        dotstat::apply_to_tree(&mut tree, &overrides);
        Ok(tree.into_directory_info(disk.to_owned()))
    }

    async fn read(&self, disk: &str, file: &FileInfo) -> Result<Vec<u8>, StorageError> {
        let inner = self.lock();
        let files = inner
            .disks
            .get(disk)
            .ok_or_else(|| StorageError::UnknownDisk(disk.to_owned()))?;
        files
            .get(&file.path())
            .map(|stored| stored.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(file.path()))
    }

    async fn delete(&self, disk: &str, file: &FileInfo) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let path = file.path();
        if inner.fail_deletes.contains(&(disk.to_owned(), path.clone())) {
            return Err(StorageError::Other("delete failure injected".to_owned()));
        }
        let files = inner
            .disks
            .get_mut(disk)
            .ok_or_else(|| StorageError::UnknownDisk(disk.to_owned()))?;
        files
            .remove(&path)
            .ok_or_else(|| StorageError::NotFound(path.clone()))?;
        inner.deleted.push(format!("{disk}/{path}"));
        Ok(())
    }
}
