// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Side-car `.stat` files.
//!
//! For any file `P`, a neighbouring `P.stat` is a small YAML document whose
//! keys override the timestamps the back-end reports for `P`. Side-car
//! files are consumed during listing and never reported as artifacts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::fs::{FileInfo, TreeNode};

/// The suffix marking side-car stat files.
pub const DOT_STAT_SUFFIX: &str = ".stat";

/// Parsed contents of a side-car stat file. Each field holds a unix epoch
/// encoded as a string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DotStat {
    born_at: Option<String>,
    modified_at: Option<String>,
    archived_at: Option<String>,
}

impl DotStat {
    /// Parses a side-car document.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_slice(bytes)
    }

    /// Overrides the timestamps of `file` with whichever fields are present.
    pub fn apply_to(&self, file: &mut FileInfo) {
        update_time_field(self.born_at.as_deref(), &mut file.born_at);
        update_time_field(self.modified_at.as_deref(), &mut file.modified_at);
        update_time_field(self.archived_at.as_deref(), &mut file.archived_at);
    }
}

/// Returns true if the file name carries the `.stat` suffix.
pub fn is_stat_file(name: &str) -> bool {
    name.ends_with(DOT_STAT_SUFFIX)
}

/// The path of the file a side-car belongs to.
pub fn target_path(stat_path: &str) -> &str {
    stat_path.strip_suffix(DOT_STAT_SUFFIX).unwrap_or(stat_path)
}

fn update_time_field(content: Option<&str>, target: &mut DateTime<Utc>) {
    let Some(content) = content else {
        return;
    };
    match content.trim().parse::<i64>() {
        Ok(epoch) => {
            if let Some(instant) = DateTime::from_timestamp(epoch, 0) {
                *target = instant;
            }
        }
        // Parsing errors are ignored; the back-end timestamp stands.
        Err(error) => tracing::debug!(content, %error, "unable to parse stat timestamp"),
    }
}

/// Applies the collected side-car overrides to a tree under construction;
/// `overrides` is keyed by the target file's path relative to the disk root.
pub(crate) fn apply_to_tree(tree: &mut TreeNode, overrides: &HashMap<String, DotStat>) {
    if overrides.is_empty() {
        return;
    }
    tree.for_each_file(&mut |file| {
        if let Some(stat) = overrides.get(&file.path()) {
            tracing::debug!(file = %file.path(), "applying .stat overrides");
            stat.apply_to(file);
        }
    });
}
