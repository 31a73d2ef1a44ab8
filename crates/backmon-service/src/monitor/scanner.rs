// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Matching directory trees against directory definitions.
//!
//! The walker descends the tree in lock-step with the filter's layers,
//! carrying a partial variable binding. Each fully matched path becomes a
//! *group*, identified by the filter's template with the bound values
//! substituted in (fused variables keep their placeholder). Within a
//! matched directory, every file definition is matched against every file.

use std::collections::HashMap;
use std::sync::Arc;

use backmon_core::definition::{DirectoryDefinition, SortBy};
use backmon_core::pattern::{VariableDefinition, SUBSTITUTION_MARKER};
use backmon_core::timestamp::Timestamp;
use backmon_core::FileDefinition;
use backmon_storage::{DirectoryInfo, FileInfo};
use chrono::{DateTime, Utc};

/// One matched file with its chosen sort time and its interpolated
/// timestamp.
#[derive(Debug, Clone)]
pub struct TemporalFile {
    /// The instant the file sorts by.
    pub time: DateTime<Utc>,
    /// The timestamp reconstructed from path and file-name captures.
    pub interpolated: DateTime<Utc>,
    /// The matched file.
    pub file: Arc<FileInfo>,
}

/// The matches of one file definition within one group.
pub type FileGroup = Vec<TemporalFile>;

/// Group key → one [`FileGroup`] per file definition of the directory.
pub type FileLookup = HashMap<String, Vec<FileGroup>>;

/// Walks `root` with the directory definition's filter and collects all
/// matching files, grouped by the reconstructed group key.
pub fn find_matching_groups(root: &DirectoryInfo, dir_def: &DirectoryDefinition) -> FileLookup {
    let mut groups = FileLookup::new();
    let mut binding = vec![String::new(); dir_def.filter.variables.len()];
    walk(root, dir_def, 0, 0, &mut binding, &mut groups);
    groups
}

fn walk(
    dir: &DirectoryInfo,
    dir_def: &DirectoryDefinition,
    level: usize,
    offset: usize,
    binding: &mut [String],
    groups: &mut FileLookup,
) {
    if level >= dir_def.filter.layers.len() {
        // A matching directory has been reached.
        let path = assemble_from_template(
            &dir_def.filter.template,
            &dir_def.filter.variables,
            binding,
        );
        let matches = find_matching_files(dir, dir_def, binding);

        let slots = groups
            .entry(path)
            .or_insert_with(|| vec![FileGroup::new(); dir_def.files.len()]);
        for (slot, found) in slots.iter_mut().zip(matches) {
            slot.extend(found);
        }
        return;
    }

    let layer = &dir_def.filter.layers[level];

    for sub_dir in dir.sub_dirs.values() {
        let Some(captures) = layer.captures(&sub_dir.name) else {
            continue;
        };

        let capture_count = captures.len() - 1;
        for i in 1..captures.len() {
            binding[offset + i - 1] = captures
                .get(i)
                .map(|m| m.as_str().to_owned())
                .unwrap_or_default();
        }

        walk(sub_dir, dir_def, level + 1, offset + capture_count, binding, groups);
    }
}

/// Reconstructs a group key from the filter template and the bound values.
/// Non-fused variables contribute their value; fused variables keep their
/// `{{name}}` placeholder, and fused time markers their `%X` spelling.
pub fn assemble_from_template(
    template: &[String],
    variables: &[VariableDefinition],
    values: &[String],
) -> String {
    if template.is_empty() {
        return ".".to_owned();
    }

    let mut assembled = String::new();
    for (i, variable) in variables.iter().enumerate() {
        assembled.push_str(&template[i]);

        if !variable.fuse {
            assembled.push_str(&values[i]);
            continue;
        }

        if variable.name.starts_with(SUBSTITUTION_MARKER) {
            assembled.push_str(&variable.name);
            continue;
        }

        assembled.push_str("{{");
        assembled.push_str(&variable.name);
        assembled.push_str("}}");
    }
    assembled.push_str(template.last().expect("template is non-empty"));

    assembled
}

/// Builds the timestamp contributed by the directory binding. Variables are
/// visited in reverse order so that earlier occurrences of a time field in
/// the path override later ones.
fn timestamp_from_binding(variables: &[VariableDefinition], values: &[String]) -> Timestamp {
    let mut timestamp = Timestamp::default();
    for (variable, value) in variables.iter().zip(values).rev() {
        if let Some(parser) = variable.parser {
            parser.apply(value, &mut timestamp);
        }
    }
    timestamp
}

fn find_matching_files(
    dir: &DirectoryInfo,
    dir_def: &DirectoryDefinition,
    binding: &[String],
) -> Vec<FileGroup> {
    let folder_time = timestamp_from_binding(&dir_def.filter.variables, binding);

    dir_def
        .files
        .iter()
        .map(|file_def| collect_matching_files(&dir.files, file_def, binding, folder_time))
        .collect()
}

fn collect_matching_files(
    files: &[Arc<FileInfo>],
    file_def: &FileDefinition,
    binding: &[String],
    folder_time: Timestamp,
) -> FileGroup {
    let mut matches = FileGroup::new();

    for file in files {
        let Some(captures) = file_def.filter.captures(&file.name) else {
            continue;
        };

        let mut timestamp = folder_time;
        let mut binding_matches = true;

        for (index, reference) in file_def.variable_mapping.iter().enumerate() {
            let capture = captures
                .get(index)
                .map(|m| m.as_str())
                .unwrap_or_default();

            if reference.offset == 0 {
                // The capture group is internal to the file pattern.
                if let Some(parser) = reference.parser {
                    parser.apply(capture, &mut timestamp);
                }
                continue;
            }

            // The capture group refers back to a directory variable; the
            // file is only accepted when the values agree.
            let bound = &binding[reference.offset - 1];
            let expected = match reference.conversion {
                Some(conversion) => conversion.apply(bound),
                None => bound.clone(),
            };
            if capture != expected {
                binding_matches = false;
                break;
            }
        }

        if !binding_matches {
            continue;
        }

        let interpolation_default = match file_def.sort_by {
            SortBy::BornAt => file.born_at,
            SortBy::ArchivedAt => file.archived_at,
            // The interpolated timestamp cannot default to itself; fall back
            // to the modification time.
            SortBy::ModifiedAt | SortBy::Interpolation => file.modified_at,
        };
        let interpolated = timestamp.with_defaults(interpolation_default);

        let time = match file_def.sort_by {
            SortBy::BornAt => file.born_at,
            SortBy::ModifiedAt => file.modified_at,
            SortBy::ArchivedAt => file.archived_at,
            SortBy::Interpolation => interpolated,
        };

        tracing::debug!(
            file = %file.name,
            %time,
            %interpolated,
            "matched backup file"
        );

        matches.push(TemporalFile {
            time,
            interpolated,
            file: file.clone(),
        });
    }

    matches
}
