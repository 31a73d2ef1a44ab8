// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Storage client for S3-compatible object stores.
//!
//! Each disk is one bucket. The store has no directory structure of its
//! own; the flat object listing is folded into a [`DirectoryInfo`] tree,
//! bounded by the requested depth. Side-car `.stat` objects are staged to
//! local temporary files for parsing and removed afterwards, including on
//! error paths.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt as _;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectMeta, ObjectStore};

use crate::client::{StorageClient, StorageError};
use crate::dotstat::{self, DotStat};
use crate::fs::{DirectoryInfo, FileInfo, TreeNode};

/// Connection settings for an S3-compatible environment.
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// The region to address.
    pub region: String,
    /// Custom endpoint for S3-compatible stores; `None` addresses AWS.
    pub endpoint: Option<String>,
    /// Static access key; falls back to the ambient AWS environment when
    /// unset.
    pub access_key_id: Option<String>,
    /// Static secret key.
    pub secret_access_key: Option<String>,
    /// Optional session token.
    pub token: Option<String>,
    /// Use path-style addressing instead of virtual-hosted style.
    pub force_path_style: bool,
    /// Allow plain HTTP to the endpoint.
    pub insecure: bool,
    /// Skip TLS certificate verification.
    pub tls_skip_verify: bool,
    /// The buckets served as disks.
    pub disks: Vec<String>,
}

/// Storage client addressing S3-compatible buckets.
pub struct S3Client {
    config: S3Config,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl S3Client {
    /// Creates a client for the configured buckets.
    pub fn new(config: S3Config) -> Self {
        Self {
            config,
            stores: Mutex::new(HashMap::new()),
        }
    }

    fn store_for(&self, disk: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        if !self.config.disks.iter().any(|name| name == disk) {
            return Err(StorageError::UnknownDisk(disk.to_owned()));
        }

        let mut stores = self.stores.lock().expect("store cache lock is never poisoned");
        if let Some(store) = stores.get(disk) {
            return Ok(store.clone());
        }

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(disk)
            .with_region(self.config.region.clone())
            .with_virtual_hosted_style_request(!self.config.force_path_style);

        if let Some(endpoint) = &self.config.endpoint {
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(self.config.insecure);
        }
        if let Some(access_key_id) = &self.config.access_key_id {
            builder = builder.with_access_key_id(access_key_id.clone());
        }
        if let Some(secret_access_key) = &self.config.secret_access_key {
            builder = builder.with_secret_access_key(secret_access_key.clone());
        }
        if let Some(token) = &self.config.token {
            builder = builder.with_token(token.clone());
        }
        if self.config.tls_skip_verify {
            builder = builder
                .with_client_options(ClientOptions::new().with_allow_invalid_certificates(true));
        }

        let store: Arc<dyn ObjectStore> = Arc::new(builder.build()?);
        stores.insert(disk.to_owned(), store.clone());
        Ok(store)
    }
}

#[async_trait]
impl StorageClient for S3Client {
    async fn disk_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.config.disks.clone())
    }

    async fn scan_disk(
        &self,
        disk: &str,
        max_depth: u32,
    ) -> Result<DirectoryInfo, StorageError> {
        let store = self.store_for(disk)?;

        let mut tree = TreeNode::default();
        let mut stat_objects: Vec<ObjectMeta> = Vec::new();

        let mut listing = store.list(None);
        while let Some(item) = listing.next().await {
            let meta = item?;
            let segments: Vec<String> = meta
                .location
                .parts()
                .map(|part| part.as_ref().to_owned())
                .collect();
            let Some((name, dirs)) = segments.split_last() else {
                continue;
            };
            if dirs.len() > max_depth as usize {
                continue;
            }

            if dotstat::is_stat_file(name) {
                stat_objects.push(meta);
                continue;
            }

            let modified = meta.last_modified;
            tree.insert(
                dirs,
                FileInfo {
                    name: name.clone(),
                    parent: dirs.join("/"),
                    size: meta.size as u64,
                    born_at: modified,
                    modified_at: modified,
                    archived_at: modified,
                },
            );
        }

        let mut overrides: HashMap<String, DotStat> = HashMap::new();
        for meta in stat_objects {
            let stat = match fetch_staged_stat(store.as_ref(), &meta.location).await {
                Ok(stat) => stat,
                Err(error) => {
                    tracing::warn!(stat_file = %meta.location, %error, "could not parse stat file");
                    continue;
                }
            };
            let target = dotstat::target_path(meta.location.as_ref()).to_owned();
            overrides.insert(target, stat);
        }
        dotstat::apply_to_tree(&mut tree, &overrides);

        Ok(tree.into_directory_info(disk.to_owned()))
    }

    async fn read(&self, disk: &str, file: &FileInfo) -> Result<Vec<u8>, StorageError> {
        let store = self.store_for(disk)?;
        let path = ObjectPath::from(file.path());
        let result = store.get(&path).await?;
        Ok(result.bytes().await?.to_vec())
    }

    async fn delete(&self, disk: &str, file: &FileInfo) -> Result<(), StorageError> {
        let store = self.store_for(disk)?;
        let path = ObjectPath::from(file.path());
        Ok(store.delete(&path).await?)
    }
}

/// Downloads a side-car object, stages it to a temporary file, and parses
/// it. The staged file is removed when the handle drops, error or not.
async fn fetch_staged_stat(
    store: &dyn ObjectStore,
    location: &ObjectPath,
) -> Result<DotStat, StorageError> {
    let bytes = store.get(location).await?.bytes().await?;

    let mut staged = tempfile::NamedTempFile::new()?;
    staged.write_all(&bytes)?;
    staged.flush()?;

    let reader = std::fs::File::open(staged.path())?;
    serde_yaml::from_reader(reader).map_err(|error| StorageError::Other(error.to_string()))
}
