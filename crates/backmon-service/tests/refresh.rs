// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! End-to-end refresh cycles against an in-memory storage back-end.

use std::sync::Arc;

use backmon_service::config::{DiskBehaviour, DisksPolicy};
use backmon_service::metrics::ApplicationMetricSet;
use backmon_service::monitor::{EnvironmentRuntime, Monitor};
use backmon_storage::memory::{MemoryClient, MemoryFile};
use backmon_test_utils::utc;
use prometheus::Registry;

const MANIFEST: &str = r#"
directories:
  "backups/{{service}}":
    alias: backups
    files:
      "dump-%Y%M%D.sql":
        alias: pgdump
        schedule: "0 1 * * *"
"#;

const PURGING_MANIFEST: &str = r#"
directories:
  "backups/{{service}}":
    alias: backups
    files:
      "dump-%Y%M%D.sql":
        alias: pgdump
        schedule: "0 1 * * *"
        purge: true
        retention-count: 1
        retention-age: 1h
"#;

fn monitor_over(client: Arc<MemoryClient>, registry: &Registry, policy: DisksPolicy) -> Monitor {
    let app_metrics = ApplicationMetricSet::new(registry);
    app_metrics.environments_total.set(1);

    Monitor::with_environments(
        vec![EnvironmentRuntime {
            name: "test".to_owned(),
            definitions: "backup_definitions.yaml".to_owned(),
            client,
            policy,
        }],
        registry.clone(),
        app_metrics,
    )
}

fn populated_client() -> Arc<MemoryClient> {
    let client = Arc::new(MemoryClient::new());
    client.put(
        "disk1",
        "backup_definitions.yaml",
        MemoryFile::at(MANIFEST, utc(2024, 1, 1, 0, 0, 0)),
    );
    client.put(
        "disk1",
        "backups/api/dump-20240101.sql",
        MemoryFile::at("one", utc(2024, 1, 1, 3, 4, 5)),
    );
    client.put(
        "disk1",
        "backups/api/dump-20240102.sql",
        MemoryFile::at("two!", utc(2024, 1, 2, 3, 4, 5)),
    );
    client
}

fn gauge_value(registry: &Registry, family: &str, labels: &[(&str, &str)]) -> Option<f64> {
    registry
        .gather()
        .into_iter()
        .find(|f| f.get_name() == family)
        .and_then(|f| {
            f.get_metric()
                .iter()
                .find(|metric| {
                    labels.iter().all(|(key, value)| {
                        metric
                            .get_label()
                            .iter()
                            .any(|pair| pair.get_name() == *key && pair.get_value() == *value)
                    })
                })
                .map(|metric| metric.get_gauge().get_value())
        })
}

fn series_count(registry: &Registry, family: &str) -> usize {
    registry
        .gather()
        .iter()
        .filter(|f| f.get_name() == family)
        .map(|f| f.get_metric().len())
        .sum()
}

#[tokio::test]
async fn refresh_publishes_group_series() {
    let registry = Registry::new();
    let client = populated_client();
    let monitor = monitor_over(client, &registry, DisksPolicy::default());

    monitor.refresh().await;

    assert_eq!(monitor.disks().await, vec!["disk1"]);
    assert_eq!(
        monitor.directories("disk1").await,
        Ok(vec!["backups".to_owned()])
    );
    assert_eq!(
        monitor.files("disk1", "backups").await,
        Ok(vec!["pgdump".to_owned()])
    );
    assert_eq!(
        monitor.variations("disk1", "backups", "pgdump").await,
        Ok(vec!["backups/api".to_owned()])
    );

    let group_labels = &[
        ("disk", "disk1"),
        ("dir", "backups"),
        ("file", "pgdump"),
        ("group", "backups/api"),
    ];
    assert_eq!(
        gauge_value(&registry, "backmon_backup_file_count", group_labels),
        Some(2.0)
    );
    assert_eq!(
        gauge_value(&registry, "backmon_backup_file_young_count", group_labels),
        Some(0.0)
    );
    // Sorting is by interpolation: the date comes from the file name, the
    // time of day from the modification attribute.
    assert_eq!(
        gauge_value(&registry, "backmon_backup_latest_file_created_at", group_labels),
        Some(utc(2024, 1, 2, 3, 4, 5).timestamp() as f64)
    );
    assert_eq!(
        gauge_value(&registry, "backmon_backup_latest_size_bytes", group_labels),
        Some(4.0)
    );

    assert_eq!(
        gauge_value(&registry, "backmon_backup_status", &[("disk", "disk1")]),
        Some(0.0)
    );
    // Two dumps plus the manifest itself.
    assert_eq!(
        gauge_value(&registry, "backmon_file_count_total", &[("disk", "disk1")]),
        Some(3.0)
    );
    assert_eq!(gauge_value(&registry, "backmon_disks_total", &[]), Some(1.0));

    let expected_at = gauge_value(
        &registry,
        "backmon_backup_latest_file_creation_expected_at",
        &[("disk", "disk1"), ("dir", "backups"), ("file", "pgdump")],
    )
    .expect("threshold series exists");
    assert!(expected_at > 0.0, "schedule has a previous fire");
}

#[tokio::test]
async fn vanished_groups_lose_their_series() {
    let registry = Registry::new();
    let client = populated_client();
    let monitor = monitor_over(client.clone(), &registry, DisksPolicy::default());

    monitor.refresh().await;
    assert_eq!(series_count(&registry, "backmon_backup_file_count"), 1);

    client.remove("disk1", "backups/api/dump-20240101.sql");
    client.remove("disk1", "backups/api/dump-20240102.sql");
    client.put(
        "disk1",
        "backups/web/dump-20240103.sql",
        MemoryFile::at("three", utc(2024, 1, 3, 3, 4, 5)),
    );

    monitor.refresh().await;

    assert_eq!(
        gauge_value(
            &registry,
            "backmon_backup_file_count",
            &[("group", "backups/web")]
        ),
        Some(1.0)
    );
    assert_eq!(series_count(&registry, "backmon_backup_file_count"), 1);
    assert_eq!(
        monitor.variations("disk1", "backups", "pgdump").await,
        Ok(vec!["backups/web".to_owned()])
    );
}

#[tokio::test]
async fn ignore_marker_drops_the_disk() {
    let registry = Registry::new();
    let client = populated_client();
    let monitor = monitor_over(client.clone(), &registry, DisksPolicy::default());

    monitor.refresh().await;
    assert_eq!(monitor.disks().await, vec!["disk1"]);

    client.put(
        "disk1",
        ".backmonignore",
        MemoryFile::at("", utc(2024, 1, 1, 0, 0, 0)),
    );
    monitor.refresh().await;

    assert!(monitor.disks().await.is_empty());
    assert_eq!(series_count(&registry, "backmon_backup_status"), 0);
    assert_eq!(gauge_value(&registry, "backmon_disks_total", &[]), Some(0.0));
}

#[tokio::test]
async fn invalid_manifest_sets_status_and_clears_definition() {
    let registry = Registry::new();
    let client = Arc::new(MemoryClient::new());
    client.put(
        "disk1",
        "backup_definitions.yaml",
        MemoryFile::at("quota: lots\n", utc(2024, 1, 1, 0, 0, 0)),
    );
    let monitor = monitor_over(client, &registry, DisksPolicy::default());

    monitor.refresh().await;

    assert_eq!(
        gauge_value(&registry, "backmon_backup_status", &[("disk", "disk1")]),
        Some(1.0)
    );
    assert_eq!(monitor.directories("disk1").await, Ok(Vec::new()));
}

#[tokio::test]
async fn missing_manifest_sets_status() {
    let registry = Registry::new();
    let client = Arc::new(MemoryClient::new());
    client.add_disk("disk1");
    let monitor = monitor_over(client, &registry, DisksPolicy::default());

    monitor.refresh().await;

    assert_eq!(
        gauge_value(&registry, "backmon_backup_status", &[("disk", "disk1")]),
        Some(1.0)
    );
}

#[tokio::test]
async fn listing_failure_drops_every_disk_of_the_environment() {
    let registry = Registry::new();
    let client = populated_client();
    let monitor = monitor_over(client.clone(), &registry, DisksPolicy::default());

    monitor.refresh().await;
    assert_eq!(series_count(&registry, "backmon_backup_status"), 1);

    client.set_fail_listing(true);
    monitor.refresh().await;

    assert!(monitor.disks().await.is_empty());
    assert_eq!(series_count(&registry, "backmon_backup_status"), 0);

    // The next successful cycle picks the disk back up.
    client.set_fail_listing(false);
    monitor.refresh().await;
    assert_eq!(monitor.disks().await, vec!["disk1"]);
}

#[tokio::test]
async fn excluded_disks_are_never_registered() {
    let registry = Registry::new();
    let client = populated_client();
    let policy = DisksPolicy::from_entries(
        &[],
        &["disk1".to_owned()],
        DiskBehaviour::Include,
    );
    let monitor = monitor_over(client, &registry, policy);

    monitor.refresh().await;

    assert!(monitor.disks().await.is_empty());
    assert_eq!(series_count(&registry, "backmon_backup_status"), 0);
}

#[tokio::test]
async fn purge_deletes_excess_files_from_storage() {
    let registry = Registry::new();
    let client = populated_client();
    client.put(
        "disk1",
        "backup_definitions.yaml",
        MemoryFile::at(PURGING_MANIFEST, utc(2024, 1, 1, 0, 0, 0)),
    );
    let monitor = monitor_over(client.clone(), &registry, DisksPolicy::default());

    monitor.refresh().await;

    assert_eq!(
        client.deleted(),
        vec!["disk1/backups/api/dump-20240101.sql"]
    );
    assert_eq!(
        gauge_value(
            &registry,
            "backmon_backup_file_count",
            &[("group", "backups/api")]
        ),
        Some(1.0)
    );
}

#[tokio::test]
async fn quota_gauge_follows_the_manifest() {
    let registry = Registry::new();
    let client = populated_client();
    client.put(
        "disk1",
        "backup_definitions.yaml",
        MemoryFile::at(
            format!("quota: 1KiB\n{MANIFEST}"),
            utc(2024, 1, 1, 0, 0, 0),
        ),
    );
    let monitor = monitor_over(client.clone(), &registry, DisksPolicy::default());

    monitor.refresh().await;
    assert_eq!(
        gauge_value(&registry, "backmon_disk_quota_bytes", &[("disk", "disk1")]),
        Some(1024.0)
    );

    // A manifest without a quota retires the gauge.
    client.put(
        "disk1",
        "backup_definitions.yaml",
        MemoryFile::at(MANIFEST, utc(2024, 1, 2, 0, 0, 0)),
    );
    monitor.refresh().await;
    assert_eq!(series_count(&registry, "backmon_disk_quota_bytes"), 0);
}
