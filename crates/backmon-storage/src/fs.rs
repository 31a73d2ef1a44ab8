// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Common data structures for files. Objects in a bucket are treated as
//! files too, so all back-ends share this tree representation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Information about one file or object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// The file name without any directory components.
    pub name: String,
    /// The parent directory path relative to the disk root; empty at the
    /// root. Components are separated by `/` on every back-end.
    pub parent: String,
    /// The file size in bytes.
    pub size: u64,
    /// When the file was initially created.
    pub born_at: DateTime<Utc>,
    /// When the file was last modified.
    pub modified_at: DateTime<Utc>,
    /// When the file was archived.
    pub archived_at: DateTime<Utc>,
}

impl FileInfo {
    /// A minimal descriptor for addressing an object by path, used to probe
    /// for marker and manifest files.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            parent: String::new(),
            size: 0,
            born_at: DateTime::UNIX_EPOCH,
            modified_at: DateTime::UNIX_EPOCH,
            archived_at: DateTime::UNIX_EPOCH,
        }
    }

    /// The path of the file relative to the disk root.
    pub fn path(&self) -> String {
        if self.parent.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.parent, self.name)
        }
    }
}

/// A directory with its files and subdirectories.
#[derive(Debug, Clone, Default)]
pub struct DirectoryInfo {
    /// The directory name; empty or the disk name at the root.
    pub name: String,
    /// Subdirectories keyed by name.
    pub sub_dirs: HashMap<String, DirectoryInfo>,
    /// The files directly contained in this directory.
    pub files: Vec<Arc<FileInfo>>,
}

impl DirectoryInfo {
    /// An empty directory with the given name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    /// The total file count and byte usage of the tree.
    pub fn file_stats(&self) -> (u64, u64) {
        let mut count = self.files.len() as u64;
        let mut bytes = self.files.iter().map(|file| file.size).sum::<u64>();
        for sub_dir in self.sub_dirs.values() {
            let (sub_count, sub_bytes) = sub_dir.file_stats();
            count += sub_count;
            bytes += sub_bytes;
        }
        (count, bytes)
    }
}

/// Accumulator for building a [`DirectoryInfo`] tree from flat object
/// listings, with file attributes still mutable.
#[derive(Debug, Default)]
pub(crate) struct TreeNode {
    pub dirs: HashMap<String, TreeNode>,
    pub files: Vec<FileInfo>,
}

impl TreeNode {
    /// Inserts `file` below the given directory segments, creating
    /// intermediate nodes as needed.
    pub fn insert(&mut self, dir_segments: &[String], file: FileInfo) {
        let mut node = self;
        for segment in dir_segments {
            node = node.dirs.entry(segment.clone()).or_default();
        }
        node.files.push(file);
    }

    /// Finalises the tree into the shared representation.
    pub fn into_directory_info(self, name: String) -> DirectoryInfo {
        DirectoryInfo {
            name,
            sub_dirs: self
                .dirs
                .into_iter()
                .map(|(sub_name, node)| {
                    let info = node.into_directory_info(sub_name.clone());
                    (sub_name, info)
                })
                .collect(),
            files: self.files.into_iter().map(Arc::new).collect(),
        }
    }

    /// Visits every file in the tree mutably.
    pub fn for_each_file(&mut self, visit: &mut impl FnMut(&mut FileInfo)) {
        for file in &mut self.files {
            visit(file);
        }
        for node in self.dirs.values_mut() {
            node.for_each_file(visit);
        }
    }
}
