// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The manifest definition model.
//!
//! A manifest is the per-disk YAML document declaring which backups are
//! expected where. Parsing proceeds in two steps: a raw serde layer that
//! preserves the document order of the `directories` and `files` maps, and a
//! compilation step that turns patterns into filters and resolves aliases,
//! schedules, and retention settings.

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::alias::make_legal_alias;
use crate::cron::{Schedule, ScheduleError};
use crate::pattern::{
    self, DirectoryFilter, PatternError, VariableDefinition, VariableReference,
};
use crate::units::{self, RawDuration, UnitsError};

/// Errors produced while parsing a manifest.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// The document is not valid YAML or contains unknown fields.
    #[error("failed to parse definitions file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Two directory definitions share an alias.
    #[error("cannot have multiple directory definitions with the alias '{0}'")]
    DuplicateDirectoryAlias(String),

    /// `fuse` listed a variable the path pattern does not declare.
    #[error("cannot fuse values of undefined variable '{0}'")]
    FuseUnknownVariable(String),

    /// A directory path pattern failed to compile.
    #[error("invalid directory pattern '{pattern}': {source}")]
    DirectoryPattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying compiler error.
        source: PatternError,
    },

    /// A schedule expression failed to parse.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The quota value is not a recognisable byte size.
    #[error("invalid quota: {0}")]
    Quota(UnitsError),

    /// A retention age does not follow the duration syntax.
    #[error("invalid retention age: {0}")]
    RetentionAge(UnitsError),
}

/// The file attribute a group is ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    /// Order by the timestamp interpolated from the patterns.
    #[default]
    Interpolation,
    /// Order by the creation attribute.
    BornAt,
    /// Order by the modification attribute.
    ModifiedAt,
    /// Order by the archival attribute.
    ArchivedAt,
}

impl SortBy {
    fn parse(value: &str) -> Self {
        match value {
            "born_at" => Self::BornAt,
            "modified_at" => Self::ModifiedAt,
            "archived_at" => Self::ArchivedAt,
            "interpolation" | "" => Self::Interpolation,
            other => {
                tracing::warn!(
                    sort = other,
                    "unknown 'sort' parameter, defaulting to 'interpolation'"
                );
                Self::Interpolation
            }
        }
    }
}

/// The parsed manifest of one disk.
#[derive(Debug, Clone, Default)]
pub struct Definition {
    /// Declared disk quota in bytes; zero means no quota.
    pub quota: u64,
    /// The directory definitions, in document order.
    pub directories: Vec<DirectoryDefinition>,
}

impl Definition {
    /// The deepest layer count over all directory filters, bounding how far
    /// a storage scan has to descend.
    pub fn max_depth(&self) -> u32 {
        self.directories
            .iter()
            .map(|dir| dir.filter.layers.len() as u32)
            .max()
            .unwrap_or(0)
    }
}

/// One directory definition of a manifest.
#[derive(Debug, Clone)]
pub struct DirectoryDefinition {
    /// The operator-facing alias; defaults to the path pattern.
    pub alias: String,
    /// The URL-safe form of the alias.
    pub safe_alias: String,
    /// The compiled path pattern.
    pub filter: DirectoryFilter,
    /// The file definitions, in document order.
    pub files: Vec<FileDefinition>,
}

/// One expected artifact kind within a directory definition.
#[derive(Debug, Clone)]
pub struct FileDefinition {
    /// The raw file-name pattern.
    pub pattern: String,
    /// The compiled file-name pattern.
    pub filter: Regex,
    /// Resolution of each capture group of `filter`.
    pub variable_mapping: Vec<VariableReference>,
    /// The operator-facing alias; defaults to the pattern.
    pub alias: String,
    /// The URL-safe form of the alias.
    pub safe_alias: String,
    /// The cron schedule backups of this kind are expected to follow.
    pub schedule: Option<Schedule>,
    /// The attribute groups of this kind are ordered by.
    pub sort_by: SortBy,
    /// Whether excess files are deleted.
    pub purge: bool,
    /// How many recent files to keep.
    pub retention_count: u64,
    /// The age below which files are always kept.
    pub retention_age: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    quota: Option<String>,
    #[serde(default, deserialize_with = "ordered_entries")]
    directories: Vec<(String, RawDirectory)>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDirectory {
    alias: Option<String>,
    #[serde(default)]
    fuse: Vec<String>,
    defaults: Option<RawFileSettings>,
    #[serde(default, deserialize_with = "ordered_entries")]
    files: Vec<(String, RawFileSettings)>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFileSettings {
    alias: Option<String>,
    schedule: Option<String>,
    sort: Option<String>,
    #[serde(rename = "retention-count")]
    retention_count: Option<u64>,
    #[serde(rename = "retention-age")]
    retention_age: Option<RawDuration>,
    purge: Option<bool>,
}

/// Effective per-file settings after applying a directory's `defaults`.
#[derive(Debug, Clone, Default)]
struct FileSettings {
    schedule: Option<Schedule>,
    sort: Option<String>,
    retention_count: u64,
    retention_age: Duration,
    purge: bool,
}

impl FileSettings {
    fn merge(&self, raw: &RawFileSettings) -> Result<Self, DefinitionError> {
        let mut settings = self.clone();

        if let Some(expression) = &raw.schedule {
            settings.schedule = Some(Schedule::parse(&units::interpolate_env(expression))?);
        }
        if let Some(sort) = &raw.sort {
            settings.sort = Some(units::interpolate_env(sort));
        }
        if let Some(purge) = raw.purge {
            settings.purge = purge;
        }
        if let Some(count) = raw.retention_count {
            settings.retention_count = count;
        }
        if let Some(age) = &raw.retention_age {
            settings.retention_age = age.resolve().map_err(DefinitionError::RetentionAge)?;
        }

        Ok(settings)
    }
}

/// Parses a manifest document into a [`Definition`].
pub fn parse_definition(bytes: &[u8]) -> Result<Definition, DefinitionError> {
    let raw: RawManifest = serde_yaml::from_slice(bytes)?;

    let quota = match raw.quota.as_deref() {
        None => 0,
        Some(value) => units::parse_bytes(&units::interpolate_env(value))
            .map_err(DefinitionError::Quota)?,
    };

    let mut directories = Vec::with_capacity(raw.directories.len());
    let mut aliases = HashSet::new();

    for (raw_pattern, raw_dir) in &raw.directories {
        let (mut filter, variable_offsets) = pattern::parse_path_pattern(raw_pattern)
            .map_err(|source| DefinitionError::DirectoryPattern {
                pattern: raw_pattern.clone(),
                source,
            })?;

        apply_fusion(&mut filter.variables, &raw_dir.fuse)?;

        let (alias, safe_alias) = match &raw_dir.alias {
            Some(explicit) => {
                let alias = units::interpolate_env(explicit);
                let (safe_alias, legal) = make_legal_alias(&alias);
                if !legal {
                    tracing::warn!(
                        %alias,
                        %safe_alias,
                        "the directory alias contained non-url characters"
                    );
                }
                (alias, safe_alias)
            }
            None => {
                let (safe_alias, _) = make_legal_alias(raw_pattern);
                (raw_pattern.clone(), safe_alias)
            }
        };

        if !aliases.insert(alias.clone()) {
            return Err(DefinitionError::DuplicateDirectoryAlias(alias));
        }

        if raw_dir.files.is_empty() {
            tracing::warn!(directory = %alias, "directory does not contain any files");
        }

        let defaults = match &raw_dir.defaults {
            Some(raw_defaults) => FileSettings::default().merge(raw_defaults)?,
            None => FileSettings::default(),
        };

        directories.push(DirectoryDefinition {
            alias,
            safe_alias,
            filter,
            files: parse_files(&raw_dir.files, &variable_offsets, &defaults)?,
        });
    }

    Ok(Definition { quota, directories })
}

/// Marks the listed variables as fused; names the pattern does not declare
/// are a hard error.
fn apply_fusion(
    variables: &mut [VariableDefinition],
    fuse_vars: &[String],
) -> Result<(), DefinitionError> {
    for fuse_var in fuse_vars {
        let mut found = false;
        for variable in variables.iter_mut() {
            if &variable.name == fuse_var {
                variable.fuse = true;
                found = true;
            }
        }
        if !found {
            return Err(DefinitionError::FuseUnknownVariable(fuse_var.clone()));
        }
    }
    Ok(())
}

fn parse_files(
    raw_files: &[(String, RawFileSettings)],
    variable_offsets: &std::collections::HashMap<String, usize>,
    defaults: &FileSettings,
) -> Result<Vec<FileDefinition>, DefinitionError> {
    let mut files = Vec::with_capacity(raw_files.len());
    let mut aliases = HashSet::new();

    for (raw_pattern, raw_file) in raw_files {
        let filter = match pattern::parse_file_pattern(raw_pattern) {
            Ok(filter) => filter,
            Err(error) => {
                tracing::error!(pattern = %raw_pattern, %error, "could not parse file pattern");
                continue;
            }
        };

        let variable_mapping = match pattern::parse_variable_references(&filter, variable_offsets)
        {
            Ok(mapping) => mapping,
            Err(error) => {
                tracing::error!(pattern = %raw_pattern, %error, "could not parse file pattern");
                continue;
            }
        };

        let settings = defaults.merge(raw_file)?;
        let (retention_count, retention_age) = retention_or_default(&settings);
        let sort_by = SortBy::parse(settings.sort.as_deref().unwrap_or(""));

        let (alias, safe_alias) = match &raw_file.alias {
            Some(explicit) => {
                let alias = units::interpolate_env(explicit);
                let (safe_alias, legal) = make_legal_alias(&alias);
                if !legal {
                    tracing::warn!(
                        %alias,
                        %safe_alias,
                        "the file alias contained non-url characters"
                    );
                }
                (alias, safe_alias)
            }
            None => {
                let (safe_alias, _) = make_legal_alias(raw_pattern);
                (raw_pattern.clone(), safe_alias)
            }
        };

        if !aliases.insert(alias.clone()) {
            tracing::error!(
                %alias,
                "cannot have multiple file definitions with the same alias"
            );
            continue;
        }

        files.push(FileDefinition {
            pattern: raw_pattern.clone(),
            filter,
            variable_mapping,
            alias,
            safe_alias,
            schedule: settings.schedule,
            sort_by,
            purge: settings.purge,
            retention_count,
            retention_age,
        });
    }

    Ok(files)
}

/// Applies the retention defaulting table: purge without retention settings
/// falls back to a count of 3 and an age of one week.
fn retention_or_default(settings: &FileSettings) -> (u64, Duration) {
    if !settings.purge {
        return (settings.retention_count, settings.retention_age);
    }

    if settings.retention_count > 0 {
        if settings.retention_age > Duration::ZERO {
            return (settings.retention_count, settings.retention_age);
        }
        return (settings.retention_count, units::WEEK);
    }

    if settings.retention_age > Duration::ZERO {
        return (3, settings.retention_age);
    }

    tracing::warn!(
        "purge is enabled, but no retention is specified; defaulting to 'count: 3' and 'age: 7d'"
    );
    (3, units::WEEK)
}

/// Deserialises a YAML mapping into a vector of entries, preserving the
/// document order (a plain map would lose it, and later entries must lose
/// alias collisions deterministically).
fn ordered_entries<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct OrderedEntries<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedEntries<T> {
        type Value = Vec<(String, T)>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a mapping")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some(entry) = access.next_entry()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedEntries(PhantomData))
}

#[cfg(test)]
mod tests {
    use backmon_test_utils::param_test;

    use super::*;
    use crate::units::WEEK;

    const SAMPLE: &str = r#"
quota: "2GiB"
directories:
  backups:
    alias: my-backups
    defaults:
      schedule: "0 2 * * *"
      retention-count: 10
      retention-age: 1w
      purge: false
    files:
      "dump-%Y%M%D.sql":
        alias: pgdump
        schedule: "0 1 * * *"
      "globals-%Y%M%D.sql": {}
"#;

    #[test]
    fn parses_sample_manifest() {
        let definition = parse_definition(SAMPLE.as_bytes()).expect("manifest is valid");

        assert_eq!(definition.quota, 2 * 1024 * 1024 * 1024);
        assert_eq!(definition.directories.len(), 1);

        let directory = &definition.directories[0];
        assert_eq!(directory.alias, "my-backups");
        assert_eq!(directory.safe_alias, "my-backups");
        assert_eq!(directory.filter.layers.len(), 1);
        assert_eq!(directory.files.len(), 2);

        let pgdump = &directory.files[0];
        assert_eq!(pgdump.alias, "pgdump");
        assert_eq!(pgdump.pattern, "dump-%Y%M%D.sql");
        assert_eq!(pgdump.retention_count, 10);
        assert_eq!(pgdump.retention_age, WEEK);
        assert!(!pgdump.purge);
        assert_eq!(
            pgdump
                .schedule
                .as_ref()
                .expect("schedule is inherited or set")
                .source(),
            "0 1 * * *"
        );

        let globals = &directory.files[1];
        assert_eq!(globals.alias, "globals-%Y%M%D.sql");
        assert_eq!(globals.safe_alias, "globals-%25Y%25M%25D.sql");
        assert_eq!(
            globals
                .schedule
                .as_ref()
                .expect("schedule is inherited")
                .source(),
            "0 2 * * *"
        );
    }

    #[test]
    fn max_depth_spans_all_directories() {
        let manifest = r#"
directories:
  "a/{{x}}/c":
    files:
      "f-%Y.log": {}
  "b":
    files:
      "g-%Y.log": {}
"#;
        let definition = parse_definition(manifest.as_bytes()).expect("manifest is valid");
        assert_eq!(definition.max_depth(), 3);
    }

    #[test]
    fn duplicate_directory_alias_is_an_error() {
        let manifest = r#"
directories:
  a:
    alias: same
    files:
      "f-%Y.log": {}
  b:
    alias: same
    files:
      "g-%Y.log": {}
"#;
        assert!(matches!(
            parse_definition(manifest.as_bytes()),
            Err(DefinitionError::DuplicateDirectoryAlias(alias)) if alias == "same"
        ));
    }

    #[test]
    fn duplicate_file_alias_keeps_the_first() {
        let manifest = r#"
directories:
  a:
    files:
      "f-%Y.log":
        alias: same
      "g-%Y.log":
        alias: same
"#;
        let definition = parse_definition(manifest.as_bytes()).expect("manifest is valid");
        let files = &definition.directories[0].files;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].pattern, "f-%Y.log");
    }

    #[test]
    fn fusing_an_unknown_variable_is_an_error() {
        let manifest = r#"
directories:
  "root/{{var1}}":
    fuse: [var1, var3]
    files:
      "f-%Y.log": {}
"#;
        assert!(matches!(
            parse_definition(manifest.as_bytes()),
            Err(DefinitionError::FuseUnknownVariable(name)) if name == "var3"
        ));
    }

    #[test]
    fn fuse_marks_the_variable() {
        let manifest = r#"
directories:
  "{{region}}/{{service}}":
    fuse: [service]
    files:
      "f-%Y-%M-%D.tgz": {}
"#;
        let definition = parse_definition(manifest.as_bytes()).expect("manifest is valid");
        let variables = &definition.directories[0].filter.variables;
        assert!(!variables[0].fuse);
        assert!(variables[1].fuse);
    }

    #[test]
    fn uncompilable_file_pattern_is_dropped() {
        let manifest = r#"
directories:
  a:
    files:
      "bad-%Y-%Y.sql": {}
      "good-%Y.sql": {}
"#;
        let definition = parse_definition(manifest.as_bytes()).expect("manifest is valid");
        let files = &definition.directories[0].files;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].pattern, "good-%Y.sql");
    }

    #[test]
    fn undefined_variable_reference_drops_the_file() {
        let manifest = r#"
directories:
  a:
    files:
      "${missing}.sql": {}
"#;
        let definition = parse_definition(manifest.as_bytes()).expect("manifest is valid");
        assert!(definition.directories[0].files.is_empty());
    }

    #[test]
    fn unknown_manifest_field_is_an_error() {
        let manifest = "quota: 1KiB\nextra: true\n";
        assert!(matches!(
            parse_definition(manifest.as_bytes()),
            Err(DefinitionError::Yaml(_))
        ));
    }

    #[test]
    fn invalid_schedule_is_an_error() {
        let manifest = r#"
directories:
  a:
    files:
      "f-%Y.log":
        schedule: "whenever"
"#;
        assert!(matches!(
            parse_definition(manifest.as_bytes()),
            Err(DefinitionError::Schedule(_))
        ));
    }

    #[test]
    fn invalid_quota_is_an_error() {
        let manifest = "quota: lots\ndirectories: {}\n";
        assert!(matches!(
            parse_definition(manifest.as_bytes()),
            Err(DefinitionError::Quota(_))
        ));
    }

    param_test! {
        applies_retention_defaults: [
            both_given: (true, 5, Duration::from_secs(3600), 5, Duration::from_secs(3600)),
            age_missing: (true, 5, Duration::ZERO, 5, WEEK),
            count_missing: (true, 0, Duration::from_secs(3600), 3, Duration::from_secs(3600)),
            both_missing: (true, 0, Duration::ZERO, 3, WEEK),
            purge_disabled: (false, 0, Duration::ZERO, 0, Duration::ZERO),
        ]
    }
    fn applies_retention_defaults(
        purge: bool,
        count: u64,
        age: Duration,
        expected_count: u64,
        expected_age: Duration,
    ) {
        let settings = FileSettings {
            purge,
            retention_count: count,
            retention_age: age,
            ..FileSettings::default()
        };
        assert_eq!(retention_or_default(&settings), (expected_count, expected_age));
    }

    param_test! {
        parses_sort_values: [
            born: ("born_at", SortBy::BornAt),
            modified: ("modified_at", SortBy::ModifiedAt),
            archived: ("archived_at", SortBy::ArchivedAt),
            interpolation: ("interpolation", SortBy::Interpolation),
            empty: ("", SortBy::Interpolation),
            unknown: ("alphabetical", SortBy::Interpolation),
        ]
    }
    fn parses_sort_values(value: &str, expected: SortBy) {
        assert_eq!(SortBy::parse(value), expected);
    }

    #[test]
    fn interpolates_alias_from_environment() {
        std::env::set_var("BACKMON_DEFINITION_TEST_ALIAS", "resolved-alias");
        let manifest = r#"
directories:
  a:
    alias: "__${BACKMON_DEFINITION_TEST_ALIAS}__"
    files:
      "f-%Y.log": {}
"#;
        let definition = parse_definition(manifest.as_bytes()).expect("manifest is valid");
        assert_eq!(definition.directories[0].alias, "resolved-alias");
    }
}
