// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Storage client for directory trees on the local filesystem.
//!
//! A local environment serves exactly one disk: the configured directory,
//! addressed by its path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::client::{StorageClient, StorageError};
use crate::dotstat::{self, DotStat};
use crate::fs::{DirectoryInfo, FileInfo};

/// Storage client rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalClient {
    directory: String,
}

impl LocalClient {
    /// Creates a client serving the given directory as its single disk.
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn check_disk(&self, disk: &str) -> Result<(), StorageError> {
        if disk == self.directory {
            Ok(())
        } else {
            Err(StorageError::UnknownDisk(disk.to_owned()))
        }
    }

    fn resolve(&self, file: &FileInfo) -> PathBuf {
        let mut path = PathBuf::from(&self.directory);
        if !file.parent.is_empty() {
            path.push(&file.parent);
        }
        path.push(&file.name);
        path
    }
}

#[async_trait]
impl StorageClient for LocalClient {
    async fn disk_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(vec![self.directory.clone()])
    }

    async fn scan_disk(
        &self,
        disk: &str,
        max_depth: u32,
    ) -> Result<DirectoryInfo, StorageError> {
        self.check_disk(disk)?;
        let root = PathBuf::from(&self.directory);

        tokio::task::spawn_blocking(move || scan_dir(&root, "", "", max_depth))
            .await
            .map_err(|error| StorageError::Other(error.to_string()))?
            .map_err(Into::into)
    }

    async fn read(&self, disk: &str, file: &FileInfo) -> Result<Vec<u8>, StorageError> {
        self.check_disk(disk)?;
        Ok(tokio::fs::read(self.resolve(file)).await?)
    }

    async fn delete(&self, disk: &str, file: &FileInfo) -> Result<(), StorageError> {
        self.check_disk(disk)?;
        Ok(tokio::fs::remove_file(self.resolve(file)).await?)
    }
}

fn scan_dir(
    root: &Path,
    path: &str,
    dir: &str,
    max_depth: u32,
) -> std::io::Result<DirectoryInfo> {
    let rel = join_rel(path, dir);
    let entries = std::fs::read_dir(root.join(&rel))?;

    let mut info = DirectoryInfo::named(dir);
    let mut overrides: HashMap<String, DotStat> = HashMap::new();
    let mut plain: Vec<FileInfo> = Vec::new();

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(error) => {
                tracing::debug!(%error, entry = %name, "skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            if max_depth < 1 {
                continue;
            }
            match scan_dir(root, &rel, &name, max_depth - 1) {
                Ok(sub_dir) => {
                    info.sub_dirs.insert(name, sub_dir);
                }
                Err(error) => {
                    tracing::debug!(%error, directory = %name, "skipping unreadable directory");
                }
            }
            continue;
        }

        if dotstat::is_stat_file(&name) {
            match std::fs::read(entry.path()).map_err(|e| e.to_string()).and_then(|bytes| {
                DotStat::parse(&bytes).map_err(|e| e.to_string())
            }) {
                Ok(stat) => {
                    let target = dotstat::target_path(&join_rel(&rel, &name)).to_owned();
                    overrides.insert(target, stat);
                }
                Err(error) => {
                    tracing::warn!(stat_file = %name, %error, "could not parse stat file");
                }
            }
            continue;
        }

        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::UNIX_EPOCH);
        let born = metadata
            .created()
            .map(DateTime::<Utc>::from)
            .unwrap_or(modified);

        plain.push(FileInfo {
            name,
            parent: rel.clone(),
            size: metadata.len(),
            born_at: born,
            modified_at: modified,
            archived_at: modified,
        });
    }

    for mut file in plain {
        if let Some(stat) = overrides.get(&file.path()) {
            stat.apply_to(&mut file);
        }
        info.files.push(Arc::new(file));
    }

    Ok(info)
}

fn join_rel(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_owned()
    } else if name.is_empty() {
        path.to_owned()
    } else {
        format!("{path}/{name}")
    }
}
