// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Retention evaluation and purging of excess files.

use backmon_core::FileDefinition;
use backmon_storage::StorageClient;
use chrono::Utc;

use super::scanner::FileGroup;

/// Orders a group newest-first by sort time.
pub fn sort_group(group: &mut FileGroup) {
    group.sort_by(|a, b| b.time.cmp(&a.time));
}

/// Applies the retention policy to a group sorted newest-first.
///
/// `young` counts the files whose sort time lies within the retention age
/// (zero age means no age floor). The newest `max(retention_count, young)`
/// files are kept; when purging is enabled, the rest are deleted through
/// the client. A failed deletion keeps the file in place with a warning;
/// deletion errors are never fatal.
///
/// Returns the surviving files, still newest-first, and the young count.
pub async fn purge(
    group: FileGroup,
    file_def: &FileDefinition,
    path: &str,
    disk: &str,
    client: &dyn StorageClient,
) -> (FileGroup, u64) {
    let young = if file_def.retention_age.is_zero() {
        0
    } else {
        let age = chrono::Duration::from_std(file_def.retention_age)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        let threshold = Utc::now() - age;
        group.partition_point(|entry| entry.time >= threshold) as u64
    };

    let keep = file_def.retention_count.max(young) as usize;

    if !file_def.purge || group.len() <= keep {
        return (group, young);
    }

    tracing::info!(
        excess = group.len() - keep,
        pattern = %file_def.pattern,
        path,
        disk,
        "purging excess files"
    );

    let mut entries = group.into_iter();
    let mut kept: FileGroup = entries.by_ref().take(keep).collect();

    for entry in entries {
        match client.delete(disk, &entry.file).await {
            Ok(()) => tracing::info!(file = %entry.file.name, "purged file"),
            Err(error) => {
                tracing::warn!(file = %entry.file.name, %error, "could not purge file");
                kept.push(entry);
            }
        }
    }

    (kept, young)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use backmon_core::parse_definition;
    use backmon_storage::memory::{MemoryClient, MemoryFile};
    use backmon_storage::FileInfo;
    use chrono::{DateTime, Utc};

    use super::super::scanner::TemporalFile;
    use super::*;

    fn file_definition(purge: bool, count: u64, age: Duration) -> FileDefinition {
        let manifest = format!(
            "directories:\n  d:\n    files:\n      \"dump-%Y%M%D.sql\":\n        \
             purge: {purge}\n        retention-count: {count}\n        \
             retention-age: {}s\n",
            age.as_secs()
        );
        parse_definition(manifest.as_bytes())
            .expect("manifest is valid")
            .directories
            .remove(0)
            .files
            .remove(0)
    }

    fn entry(disk_path: &str, time: DateTime<Utc>) -> TemporalFile {
        let (parent, name) = disk_path
            .rsplit_once('/')
            .map(|(p, n)| (p.to_owned(), n.to_owned()))
            .unwrap_or_else(|| (String::new(), disk_path.to_owned()));
        let mut file = FileInfo::named(&name);
        file.parent = parent;
        TemporalFile {
            time,
            interpolated: time,
            file: Arc::new(file),
        }
    }

    fn populated_client(paths: &[&str]) -> MemoryClient {
        let client = MemoryClient::new();
        for path in paths {
            client.put("disk1", path, MemoryFile::at("x", Utc::now()));
        }
        client
    }

    #[tokio::test]
    async fn young_files_are_never_purged() {
        // Ten files modified within the last 24 hours with a retention
        // count of three: the age floor keeps all of them.
        let file_def = file_definition(true, 3, Duration::from_secs(24 * 3600));
        let client = MemoryClient::new();

        let now = Utc::now();
        let mut group: FileGroup = (0..10)
            .map(|i| entry(&format!("dump-{i}.sql"), now - chrono::Duration::minutes(i)))
            .collect();
        sort_group(&mut group);

        let (kept, young) = purge(group, &file_def, ".", "disk1", &client).await;

        assert_eq!(young, 10);
        assert_eq!(kept.len(), 10);
        assert!(client.deleted().is_empty());
    }

    #[tokio::test]
    async fn zero_age_means_no_age_floor() {
        let file_def = file_definition(true, 2, Duration::ZERO);
        // Parsing defaults a zero age to one week under purge; force the
        // zero back in to exercise the no-floor path.
        let file_def = FileDefinition {
            retention_age: Duration::ZERO,
            ..file_def
        };
        let client = populated_client(&["old-1.sql", "old-2.sql", "old-3.sql"]);

        let now = Utc::now();
        let mut group: FileGroup = (1..=3)
            .map(|i| entry(&format!("old-{i}.sql"), now - chrono::Duration::days(i)))
            .collect();
        sort_group(&mut group);

        let (kept, young) = purge(group, &file_def, ".", "disk1", &client).await;

        assert_eq!(young, 0);
        assert_eq!(kept.len(), 2);
        assert_eq!(client.deleted(), vec!["disk1/old-3.sql"]);
    }

    #[tokio::test]
    async fn purge_disabled_deletes_nothing() {
        let file_def = file_definition(false, 1, Duration::ZERO);
        let client = populated_client(&["old-1.sql", "old-2.sql"]);

        let now = Utc::now();
        let group: FileGroup = (1..=2)
            .map(|i| entry(&format!("old-{i}.sql"), now - chrono::Duration::days(i)))
            .collect();

        let (kept, _) = purge(group, &file_def, ".", "disk1", &client).await;

        assert_eq!(kept.len(), 2);
        assert!(client.deleted().is_empty());
    }

    #[tokio::test]
    async fn failed_deletions_keep_the_file() {
        let file_def = file_definition(true, 1, Duration::from_secs(3600));
        let client = populated_client(&["old-1.sql", "old-2.sql", "old-3.sql"]);
        client.fail_delete("disk1", "old-2.sql");

        let now = Utc::now();
        let mut group: FileGroup = (1..=3)
            .map(|i| entry(&format!("old-{i}.sql"), now - chrono::Duration::days(i)))
            .collect();
        sort_group(&mut group);

        let (kept, young) = purge(group, &file_def, ".", "disk1", &client).await;

        assert_eq!(young, 0);
        assert_eq!(kept.len(), 2, "the failed deletion is retained");
        assert_eq!(kept[1].file.name, "old-2.sql");
        assert_eq!(client.deleted(), vec!["disk1/old-3.sql"]);
    }

    #[tokio::test]
    async fn raising_retention_count_never_deletes_more() {
        let now = Utc::now();
        let build_group = || -> FileGroup {
            let mut group: FileGroup = (1..=6)
                .map(|i| entry(&format!("old-{i}.sql"), now - chrono::Duration::days(i)))
                .collect();
            sort_group(&mut group);
            group
        };

        let mut previous_deleted = usize::MAX;
        for count in [1u64, 2, 3, 6, 8] {
            let file_def = file_definition(true, count, Duration::from_secs(3600));
            let client = populated_client(&[
                "old-1.sql",
                "old-2.sql",
                "old-3.sql",
                "old-4.sql",
                "old-5.sql",
                "old-6.sql",
            ]);

            let (_, _) = purge(build_group(), &file_def, ".", "disk1", &client).await;

            let deleted = client.deleted().len();
            assert!(deleted <= previous_deleted, "count {count} deleted more");
            previous_deleted = deleted;
        }
    }
}
