// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The metrics publisher.
//!
//! Every disk owns one [`DiskMetrics`] instance whose gauge families carry
//! the disk name as a constant label. Families are registered when the disk
//! appears and unregistered when it vanishes, and per-group series are
//! deleted as soon as their group disappears, so no refresh leaks stale
//! label sets.

use std::time::Duration;

use backmon_storage::FileInfo;
use chrono::{DateTime, Utc};
use prometheus::core::Collector;
use prometheus::{Gauge, GaugeVec, IntGauge, Opts, Registry};

/// Namespace of every exported metric.
pub const NAMESPACE: &str = "backmon";
/// Subsystem of the per-definition and per-group families.
pub const SUBSYSTEM: &str = "backup";

/// The `dir` label.
pub const LABEL_DIR: &str = "dir";
/// The `file` label.
pub const LABEL_FILE: &str = "file";
/// The `group` label.
pub const LABEL_GROUP: &str = "group";

backmon_utils::metrics::define_metric_set! {
    #[namespace = "backmon"]
    /// Application-wide gauges.
    pub struct ApplicationMetricSet {
        #[help = "Total number of configured environments"]
        environments_total: IntGauge[],
        #[help = "Total number of registered disks"]
        disks_total: IntGauge[],
    }
}

/// The gauge families of one disk.
#[derive(Debug, Clone)]
pub struct DiskMetrics {
    registry: Registry,
    status: Gauge,
    file_count_total: Gauge,
    disk_usage: Gauge,
    disk_quota: Gauge,
    file_count_expected: GaugeVec,
    file_age_threshold: GaugeVec,
    latest_file_creation_expected_at: GaugeVec,
    file_count: GaugeVec,
    file_young_count: GaugeVec,
    latest_file_created_at: GaugeVec,
    latest_file_creation_duration: GaugeVec,
    latest_file_born_at: GaugeVec,
    latest_file_modified_at: GaugeVec,
    latest_file_archived_at: GaugeVec,
    latest_size: GaugeVec,
}

impl DiskMetrics {
    /// Creates the gauge families for `disk` and registers all of them
    /// except the quota gauge, which only exists while a quota is declared.
    pub fn register(registry: &Registry, disk: &str) -> Self {
        let metrics = Self {
            registry: registry.clone(),
            status: disk_gauge(
                disk,
                SUBSYSTEM,
                "status",
                "Indicates whether there were any problems collecting metrics for this disk. \
                 Any value >0 means that errors occurred.",
            ),
            file_count_total: disk_gauge(
                disk,
                "",
                "file_count_total",
                "The total amount of backup files present.",
            ),
            disk_usage: disk_gauge(disk, "", "disk_usage_bytes", "The amount of bytes used on a disk."),
            disk_quota: disk_gauge(
                disk,
                "",
                "disk_quota_bytes",
                "The amount of bytes usable on a disk.",
            ),
            file_count_expected: disk_gauge_vec(
                disk,
                "files_maximum_count",
                "The amount of backup files expected to be present in this group.",
                &[LABEL_DIR, LABEL_FILE],
            ),
            file_age_threshold: disk_gauge_vec(
                disk,
                "files_maximum_age_seconds",
                "The maximum age (in seconds) that any file in this group should reach.",
                &[LABEL_DIR, LABEL_FILE],
            ),
            latest_file_creation_expected_at: disk_gauge_vec(
                disk,
                "latest_file_creation_expected_at",
                "Unix timestamp on which the latest backup in the corresponding file group \
                 should have occurred.",
                &[LABEL_DIR, LABEL_FILE],
            ),
            file_count: disk_gauge_vec(
                disk,
                "file_count",
                "The amount of backup files present in this group.",
                &[LABEL_DIR, LABEL_FILE, LABEL_GROUP],
            ),
            file_young_count: disk_gauge_vec(
                disk,
                "file_young_count",
                "The amount of backup files in this group that are younger than the maximum age.",
                &[LABEL_DIR, LABEL_FILE, LABEL_GROUP],
            ),
            latest_file_created_at: disk_gauge_vec(
                disk,
                "latest_file_created_at",
                "Unix timestamp on which the latest backup in the corresponding file group \
                 was created.",
                &[LABEL_DIR, LABEL_FILE, LABEL_GROUP],
            ),
            latest_file_creation_duration: disk_gauge_vec(
                disk,
                "latest_file_creation_duration",
                "Describes how long it took to create the backup file in seconds.",
                &[LABEL_DIR, LABEL_FILE, LABEL_GROUP],
            ),
            latest_file_born_at: disk_gauge_vec(
                disk,
                "latest_file_born_at",
                "Unix timestamp on which the latest file has been initially created.",
                &[LABEL_DIR, LABEL_FILE, LABEL_GROUP],
            ),
            latest_file_modified_at: disk_gauge_vec(
                disk,
                "latest_file_modified_at",
                "Unix timestamp on which the latest file has been modified.",
                &[LABEL_DIR, LABEL_FILE, LABEL_GROUP],
            ),
            latest_file_archived_at: disk_gauge_vec(
                disk,
                "latest_file_archived_at",
                "Unix timestamp on which the latest file has been archived.",
                &[LABEL_DIR, LABEL_FILE, LABEL_GROUP],
            ),
            latest_size: disk_gauge_vec(
                disk,
                "latest_size_bytes",
                "Size (in bytes) of the latest backup in the corresponding file group.",
                &[LABEL_DIR, LABEL_FILE, LABEL_GROUP],
            ),
        };

        for collector in metrics.base_collectors() {
            if let Err(error) = metrics.registry.register(collector) {
                tracing::error!(disk, %error, "failed to register disk metric");
            }
        }

        metrics
    }

    /// Unregisters every family of this disk, including the quota gauge.
    pub fn drop_all(&self) {
        for collector in self.base_collectors() {
            let _ = self.registry.unregister(collector);
        }
        let _ = self.registry.unregister(Box::new(self.disk_quota.clone()));
    }

    /// Marks the disk's manifest as missing or invalid: `status` goes to 1,
    /// the quota vanishes, and all per-definition series are reset.
    pub fn definitions_missing(&self) {
        self.status.set(1.0);
        let _ = self.registry.unregister(Box::new(self.disk_quota.clone()));
        self.reset_series();
    }

    /// Marks the manifest as freshly parsed: `status` goes to 0 and all
    /// per-definition series start over.
    pub fn definitions_updated(&self) {
        self.status.set(0.0);
        self.reset_series();
    }

    /// Publishes the per-definition thresholds.
    pub fn update_file_limits(
        &self,
        dir: &str,
        file: &str,
        count: u64,
        age: Duration,
        previous_fire: Option<DateTime<Utc>>,
    ) {
        self.file_count_expected
            .with_label_values(&[dir, file])
            .set(count as f64);
        self.file_age_threshold
            .with_label_values(&[dir, file])
            .set(age.as_secs_f64());
        self.latest_file_creation_expected_at
            .with_label_values(&[dir, file])
            .set(previous_fire.map_or(0.0, |instant| instant.timestamp() as f64));
    }

    /// Publishes the observed counts of one group. A group without matches
    /// keeps its zero counts but loses its `latest_*` series.
    pub fn update_file_counts(&self, dir: &str, file: &str, group: &str, present: usize, young: u64) {
        self.file_count
            .with_label_values(&[dir, file, group])
            .set(present as f64);
        self.file_young_count
            .with_label_values(&[dir, file, group])
            .set(young as f64);

        if present == 0 {
            self.delete_latest_series(dir, file, group);
        }
    }

    /// Publishes the attributes of the newest file of one group.
    pub fn update_latest_file(
        &self,
        dir: &str,
        file: &str,
        group: &str,
        info: &FileInfo,
        time: DateTime<Utc>,
    ) {
        let labels = &[dir, file, group];
        self.latest_file_created_at
            .with_label_values(labels)
            .set(time.timestamp() as f64);
        self.latest_file_creation_duration
            .with_label_values(labels)
            .set((info.modified_at.timestamp() - info.born_at.timestamp()) as f64);
        self.latest_file_born_at
            .with_label_values(labels)
            .set(info.born_at.timestamp() as f64);
        self.latest_file_modified_at
            .with_label_values(labels)
            .set(info.modified_at.timestamp() as f64);
        self.latest_file_archived_at
            .with_label_values(labels)
            .set(info.archived_at.timestamp() as f64);
        self.latest_size
            .with_label_values(labels)
            .set(info.size as f64);
    }

    /// Publishes the disk-wide usage totals.
    pub fn update_usage(&self, file_count: u64, used_bytes: u64) {
        self.file_count_total.set(file_count as f64);
        self.disk_usage.set(used_bytes as f64);
    }

    /// Publishes or retires the quota gauge; it is only exported while a
    /// quota is declared.
    pub fn update_quota(&self, quota: u64) {
        if quota > 0 {
            match self.registry.register(Box::new(self.disk_quota.clone())) {
                Ok(()) => {}
                Err(prometheus::Error::AlreadyReg) => {
                    tracing::debug!("disk quota metric is already registered");
                }
                Err(error) => {
                    tracing::error!(%error, "failed to register disk quota metric");
                }
            }
            self.disk_quota.set(quota as f64);
        } else {
            let _ = self.registry.unregister(Box::new(self.disk_quota.clone()));
        }
    }

    /// Deletes every series of a group that no longer exists.
    pub fn drop_file(&self, dir: &str, file: &str, group: &str) {
        let labels = &[dir, file, group];
        let _ = self.file_count.remove_label_values(labels);
        let _ = self.file_young_count.remove_label_values(labels);
        self.delete_latest_series(dir, file, group);
    }

    fn delete_latest_series(&self, dir: &str, file: &str, group: &str) {
        let labels = &[dir, file, group];
        let _ = self.latest_file_created_at.remove_label_values(labels);
        let _ = self.latest_file_creation_duration.remove_label_values(labels);
        let _ = self.latest_file_born_at.remove_label_values(labels);
        let _ = self.latest_file_modified_at.remove_label_values(labels);
        let _ = self.latest_file_archived_at.remove_label_values(labels);
        let _ = self.latest_size.remove_label_values(labels);
    }

    fn reset_series(&self) {
        self.file_count_expected.reset();
        self.file_age_threshold.reset();
        self.latest_file_creation_expected_at.reset();
        self.file_count.reset();
        self.file_young_count.reset();
        self.latest_file_created_at.reset();
        self.latest_file_creation_duration.reset();
        self.latest_file_born_at.reset();
        self.latest_file_modified_at.reset();
        self.latest_file_archived_at.reset();
        self.latest_size.reset();
    }

    fn base_collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.status.clone()),
            Box::new(self.file_count_total.clone()),
            Box::new(self.disk_usage.clone()),
            Box::new(self.file_count_expected.clone()),
            Box::new(self.file_age_threshold.clone()),
            Box::new(self.latest_file_creation_expected_at.clone()),
            Box::new(self.file_count.clone()),
            Box::new(self.file_young_count.clone()),
            Box::new(self.latest_file_created_at.clone()),
            Box::new(self.latest_file_creation_duration.clone()),
            Box::new(self.latest_file_born_at.clone()),
            Box::new(self.latest_file_modified_at.clone()),
            Box::new(self.latest_file_archived_at.clone()),
            Box::new(self.latest_size.clone()),
        ]
    }
}

fn disk_gauge(disk: &str, subsystem: &str, name: &str, help: &str) -> Gauge {
    let mut opts = Opts::new(name, help)
        .namespace(NAMESPACE)
        .const_label("disk", disk);
    if !subsystem.is_empty() {
        opts = opts.subsystem(subsystem);
    }
    Gauge::with_opts(opts).expect("gauge options defined at compile time are valid")
}

fn disk_gauge_vec(disk: &str, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let opts = Opts::new(name, help)
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM)
        .const_label("disk", disk);
    GaugeVec::new(opts, labels).expect("gauge options defined at compile time are valid")
}
