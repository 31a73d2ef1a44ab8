// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The refresh coordinator.
//!
//! A [`Monitor`] owns the per-environment disk registries and drives the
//! periodic refresh cycle: enumerate disks, diff against the previous
//! cycle, re-read manifests, scan trees, apply retention, and publish
//! metrics. A cycle runs under the state's write lock, so HTTP readers
//! always observe a consistent snapshot, and external triggers coalesce
//! into at most one queued refresh.

pub mod retention;
pub mod scanner;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backmon_core::alias::make_legal_alias;
use backmon_core::definition::{parse_definition, Definition};
use backmon_storage::{
    DirectoryInfo, FileInfo, LocalClient, S3Client, S3Config, StorageClient, StorageError,
};
use chrono::Utc;
use prometheus::Registry;
use sha2::{Digest as _, Sha256};
use tokio::sync::{Notify, RwLock};
use tokio::time::MissedTickBehavior;

use crate::config::{ClientConfig, Configuration, DisksPolicy, EnvironmentConfig};
use crate::metrics::{ApplicationMetricSet, DiskMetrics};

/// Marker file whose presence excludes a disk from monitoring.
pub const IGNORE_FILE: &str = ".backmonignore";

/// A missing path segment in an API lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    /// No such disk.
    Disk(String),
    /// No such directory definition on the disk.
    Directory(String),
    /// No such file definition in the directory.
    File(String),
    /// No such group for the file definition.
    Group(String),
}

/// Per-group survivors of the last refresh: the newest file per file
/// definition, indexed like the directory's file list.
type GroupHistory = HashMap<String, Vec<Option<Arc<FileInfo>>>>;

struct DiskState {
    name: String,
    safe_name: String,
    metrics: DiskMetrics,
    definition: Option<Definition>,
    definition_hash: Option<[u8; 32]>,
    /// One entry per directory definition.
    groups: Vec<GroupHistory>,
}

impl DiskState {
    fn update_definition(&mut self, bytes: &[u8]) {
        let hash: [u8; 32] = Sha256::digest(bytes).into();
        if self.definition_hash == Some(hash) {
            tracing::debug!(disk = %self.name, "backup definitions are unchanged");
            return;
        }

        tracing::info!(disk = %self.name, "backup definitions changed, parsing new definitions");
        match parse_definition(bytes) {
            Ok(definition) => {
                self.definition_hash = Some(hash);
                self.groups = vec![GroupHistory::new(); definition.directories.len()];
                self.metrics.definitions_updated();
                self.metrics.update_quota(definition.quota);
                self.definition = Some(definition);
            }
            Err(error) => {
                tracing::error!(disk = %self.name, %error, "failed to parse backup definitions");
                // The hash is not stored, so the next refresh parses again.
                self.definition_hash = None;
                self.definition = None;
                self.metrics.definitions_missing();
            }
        }
    }
}

struct EnvironmentState {
    name: String,
    definition_filename: String,
    client: Arc<dyn StorageClient>,
    policy: DisksPolicy,
    disks: HashMap<String, DiskState>,
}

struct MonitorState {
    environments: Vec<EnvironmentState>,
}

/// Coordinates refresh cycles and serves the state they publish.
pub struct Monitor {
    state: RwLock<MonitorState>,
    registry: Registry,
    app_metrics: ApplicationMetricSet,
    refresh_requested: Notify,
}

/// One environment with an already constructed storage client.
pub struct EnvironmentRuntime {
    /// The environment name, used in logs.
    pub name: String,
    /// Path of the manifest file on each of the environment's disks.
    pub definitions: String,
    /// The storage client serving the environment.
    pub client: Arc<dyn StorageClient>,
    /// Which disks to monitor.
    pub policy: DisksPolicy,
}

impl Monitor {
    /// Builds the monitor and its storage clients from the configuration.
    pub fn new(
        config: &Configuration,
        registry: Registry,
        app_metrics: ApplicationMetricSet,
    ) -> Self {
        let environments = config
            .environments
            .iter()
            .map(|environment| EnvironmentRuntime {
                name: environment.name.clone(),
                definitions: environment.definitions.clone(),
                client: build_client(environment),
                policy: environment.disks.clone(),
            })
            .collect();

        Self::with_environments(environments, registry, app_metrics)
    }

    /// Builds the monitor over explicitly constructed environments.
    pub fn with_environments(
        environments: Vec<EnvironmentRuntime>,
        registry: Registry,
        app_metrics: ApplicationMetricSet,
    ) -> Self {
        let environments = environments
            .into_iter()
            .map(|environment| EnvironmentState {
                name: environment.name,
                definition_filename: environment.definitions,
                client: environment.client,
                policy: environment.policy,
                disks: HashMap::new(),
            })
            .collect();

        Self {
            state: RwLock::new(MonitorState { environments }),
            registry,
            app_metrics,
            refresh_requested: Notify::new(),
        }
    }

    /// The registry all disk metrics are published to.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Queues a refresh; triggers arriving while a cycle runs coalesce into
    /// a single pending one.
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// Runs refresh cycles forever: once immediately, then on every
    /// interval tick or external trigger.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.refresh_requested.notified() => {}
            }
            self.refresh().await;
        }
    }

    /// Executes one refresh cycle.
    #[tracing::instrument(skip_all)]
    pub async fn refresh(&self) {
        tracing::info!("updating disks info");
        let mut state = self.state.write().await;

        for environment in &mut state.environments {
            tracing::debug!(environment = %environment.name, "updating disks");
            if let Err(error) = self.refresh_environment(environment).await {
                tracing::error!(
                    environment = %environment.name,
                    %error,
                    "could not retrieve disk names from client"
                );
            }
        }

        tracing::debug!("disks info updated");
    }

    async fn refresh_environment(
        &self,
        environment: &mut EnvironmentState,
    ) -> Result<(), StorageError> {
        let disk_names = match environment.client.disk_names().await {
            Ok(names) => names,
            Err(error) => {
                for (_, disk) in environment.disks.drain() {
                    disk.metrics.drop_all();
                    self.app_metrics.disks_total.dec();
                }
                return Err(error);
            }
        };

        // Disks the back-end no longer lists lose their series.
        let removed: Vec<String> = environment
            .disks
            .keys()
            .filter(|known| !disk_names.iter().any(|name| name == *known))
            .cloned()
            .collect();
        for name in removed {
            if let Some(disk) = environment.disks.remove(&name) {
                disk.metrics.drop_all();
                self.app_metrics.disks_total.dec();
            }
        }

        for name in &disk_names {
            if !environment.policy.is_included(name) {
                continue;
            }

            let ignore_marker = FileInfo::named(IGNORE_FILE);
            if environment.client.read(name, &ignore_marker).await.is_ok() {
                if let Some(disk) = environment.disks.remove(name) {
                    disk.metrics.drop_all();
                    self.app_metrics.disks_total.dec();
                }
                tracing::info!(disk = %name, marker = IGNORE_FILE, "ignoring disk");
                continue;
            }

            if !environment.disks.contains_key(name) {
                let (safe_name, _) = make_legal_alias(name);
                environment.disks.insert(
                    name.clone(),
                    DiskState {
                        name: name.clone(),
                        safe_name,
                        metrics: DiskMetrics::register(&self.registry, name),
                        definition: None,
                        definition_hash: None,
                        groups: Vec::new(),
                    },
                );
                self.app_metrics.disks_total.inc();
            }
        }

        for (disk_name, disk) in environment.disks.iter_mut() {
            tracing::debug!(
                environment = %environment.name,
                disk = %disk_name,
                "downloading backup definitions file"
            );

            let manifest_file = FileInfo::named(&environment.definition_filename);
            let manifest = match environment.client.read(disk_name, &manifest_file).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::error!(
                        environment = %environment.name,
                        disk = %disk_name,
                        definitions = %environment.definition_filename,
                        %error,
                        "backup definitions file could not be opened"
                    );
                    disk.definition = None;
                    disk.definition_hash = None;
                    disk.metrics.definitions_missing();
                    continue;
                }
            };

            disk.update_definition(&manifest);
            let Some(definition) = disk.definition.clone() else {
                continue;
            };

            let tree = match environment
                .client
                .scan_disk(disk_name, definition.max_depth())
                .await
            {
                Ok(tree) => tree,
                Err(error) => {
                    tracing::error!(
                        environment = %environment.name,
                        disk = %disk_name,
                        %error,
                        "failed to retrieve files from disk"
                    );
                    // The metrics still have to be updated, against an
                    // empty tree.
                    DirectoryInfo::named(disk_name)
                }
            };

            update_disk_metrics(environment.client.as_ref(), disk, &definition, &tree).await;
        }

        Ok(())
    }

    /// The raw names of all monitored disks.
    pub async fn disks(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state
            .environments
            .iter()
            .flat_map(|environment| environment.disks.keys().cloned())
            .collect();
        names.sort();
        names
    }

    /// The directory aliases defined on a disk.
    pub async fn directories(&self, disk: &str) -> Result<Vec<String>, Missing> {
        let state = self.state.read().await;
        let disk_state = find_disk(&state, disk)?;
        Ok(disk_state
            .definition
            .as_ref()
            .map(|definition| {
                definition
                    .directories
                    .iter()
                    .map(|dir| dir.alias.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// The file-definition aliases of a directory.
    pub async fn files(&self, disk: &str, directory: &str) -> Result<Vec<String>, Missing> {
        let state = self.state.read().await;
        let disk_state = find_disk(&state, disk)?;
        let (_, dir_def) = find_directory(disk_state, directory)?;
        Ok(dir_def.files.iter().map(|file| file.alias.clone()).collect())
    }

    /// The group keys a file definition currently has matches in.
    pub async fn variations(
        &self,
        disk: &str,
        directory: &str,
        file: &str,
    ) -> Result<Vec<String>, Missing> {
        let state = self.state.read().await;
        let disk_state = find_disk(&state, disk)?;
        let (dir_index, dir_def) = find_directory(disk_state, directory)?;
        let file_index = find_file(dir_def, file)?;

        let mut groups: Vec<String> = disk_state
            .groups
            .get(dir_index)
            .map(|history| {
                history
                    .iter()
                    .filter(|(_, latest)| latest.get(file_index).is_some_and(Option::is_some))
                    .map(|(group, _)| group.clone())
                    .collect()
            })
            .unwrap_or_default();
        groups.sort();
        Ok(groups)
    }

    /// Resolves the newest file of a group for downloading, together with
    /// the client serving it.
    pub async fn latest_file(
        &self,
        disk: &str,
        directory: &str,
        file: &str,
        group: &str,
    ) -> Result<(Arc<dyn StorageClient>, String, Arc<FileInfo>), Missing> {
        let state = self.state.read().await;

        for environment in &state.environments {
            let Some(disk_state) = environment
                .disks
                .values()
                .find(|candidate| candidate.name == disk || candidate.safe_name == disk)
            else {
                continue;
            };
            let (dir_index, dir_def) = find_directory(disk_state, directory)?;
            let file_index = find_file(dir_def, file)?;

            let latest = disk_state
                .groups
                .get(dir_index)
                .and_then(|history| history.get(group))
                .and_then(|latest| latest.get(file_index).cloned().flatten())
                .ok_or_else(|| Missing::Group(group.to_owned()))?;

            return Ok((environment.client.clone(), disk_state.name.clone(), latest));
        }

        Err(Missing::Disk(disk.to_owned()))
    }
}

// API path segments arrive percent-decoded and are accepted against both
// the raw alias and its url-safe form.

fn find_disk<'a>(state: &'a MonitorState, disk: &str) -> Result<&'a DiskState, Missing> {
    state
        .environments
        .iter()
        .flat_map(|environment| environment.disks.values())
        .find(|candidate| candidate.name == disk || candidate.safe_name == disk)
        .ok_or_else(|| Missing::Disk(disk.to_owned()))
}

fn find_directory<'a>(
    disk: &'a DiskState,
    directory: &str,
) -> Result<(usize, &'a backmon_core::DirectoryDefinition), Missing> {
    disk.definition
        .as_ref()
        .and_then(|definition| {
            definition
                .directories
                .iter()
                .enumerate()
                .find(|(_, dir)| dir.alias == directory || dir.safe_alias == directory)
        })
        .ok_or_else(|| Missing::Directory(directory.to_owned()))
}

fn find_file(
    dir_def: &backmon_core::DirectoryDefinition,
    file: &str,
) -> Result<usize, Missing> {
    dir_def
        .files
        .iter()
        .position(|candidate| candidate.alias == file || candidate.safe_alias == file)
        .ok_or_else(|| Missing::File(file.to_owned()))
}

fn build_client(environment: &EnvironmentConfig) -> Arc<dyn StorageClient> {
    match &environment.client {
        ClientConfig::Local { directory } => Arc::new(LocalClient::new(directory.clone())),
        ClientConfig::S3 {
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            token,
            force_path_style,
            insecure,
            tls_skip_verify,
            auto_discover_disks,
        } => {
            if *auto_discover_disks {
                tracing::warn!(
                    environment = %environment.name,
                    "bucket auto-discovery is not supported; monitoring the explicitly \
                     included disks"
                );
            }
            Arc::new(S3Client::new(S3Config {
                region: region.clone(),
                endpoint: endpoint.clone(),
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                token: token.clone(),
                force_path_style: *force_path_style,
                insecure: *insecure,
                tls_skip_verify: *tls_skip_verify,
                disks: environment.disks.explicit_includes(),
            }))
        }
    }
}

/// Scans one disk, applies retention, and publishes the resulting series.
async fn update_disk_metrics(
    client: &dyn StorageClient,
    disk: &mut DiskState,
    definition: &Definition,
    root: &DirectoryInfo,
) {
    let now = Utc::now();

    let (total_count, total_bytes) = root.file_stats();
    disk.metrics.update_usage(total_count, total_bytes);

    for (dir_index, dir_def) in definition.directories.iter().enumerate() {
        let mut file_groups = scanner::find_matching_groups(root, dir_def);

        if file_groups.is_empty() {
            tracing::warn!(
                disk = %disk.name,
                directory = %dir_def.alias,
                "no file groups found; either the root directory is wrong or no files match \
                 the defined pattern"
            );
        }

        for file_def in &dir_def.files {
            let previous_fire = file_def
                .schedule
                .as_ref()
                .and_then(|schedule| schedule.previous_fire(now));
            disk.metrics.update_file_limits(
                &dir_def.alias,
                &file_def.alias,
                file_def.retention_count,
                file_def.retention_age,
                previous_fire,
            );
        }

        let mut current_groups = GroupHistory::with_capacity(file_groups.len());

        for (group_key, mut per_definition) in file_groups.drain() {
            let mut latest: Vec<Option<Arc<FileInfo>>> = vec![None; dir_def.files.len()];

            for (file_index, file_def) in dir_def.files.iter().enumerate() {
                let mut matches = std::mem::take(&mut per_definition[file_index]);
                retention::sort_group(&mut matches);
                let (matches, young) =
                    retention::purge(matches, file_def, &group_key, &disk.name, client).await;

                disk.metrics.update_file_counts(
                    &dir_def.alias,
                    &file_def.alias,
                    &group_key,
                    matches.len(),
                    young,
                );

                if let Some(newest) = matches.first() {
                    latest[file_index] = Some(newest.file.clone());
                    disk.metrics.update_latest_file(
                        &dir_def.alias,
                        &file_def.alias,
                        &group_key,
                        &newest.file,
                        newest.time,
                    );
                }
            }

            current_groups.insert(group_key, latest);
        }

        if disk.groups.len() <= dir_index {
            disk.groups.resize_with(dir_index + 1, GroupHistory::new);
        }
        let past_groups = std::mem::replace(&mut disk.groups[dir_index], current_groups);

        // Series of groups that vanished since the previous cycle.
        for group in past_groups.keys() {
            if disk.groups[dir_index].contains_key(group) {
                continue;
            }
            for file_def in &dir_def.files {
                disk.metrics.drop_file(&dir_def.alias, &file_def.alias, group);
            }
        }
    }
}
