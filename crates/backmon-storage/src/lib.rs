// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Storage back-ends monitored by backmon.
//!
//! The [`StorageClient`] trait is the engine's only view of a back-end: it
//! enumerates storage units ("disks"), lists a unit's directory tree to a
//! bounded depth, reads single objects, and deletes single objects. Two
//! implementations ship with the crate: [`LocalClient`] for directory trees
//! on the local filesystem and [`S3Client`] for S3-compatible object stores.
//!
//! Side-car `.stat` files (see [`dotstat`]) are resolved by the clients
//! while listing, so the engine only ever sees effective file attributes.

pub mod client;
pub mod dotstat;
pub mod fs;
pub mod local;
pub mod s3;

#[cfg(feature = "test-utils")]
pub mod memory;

pub use client::{StorageClient, StorageError};
pub use fs::{DirectoryInfo, FileInfo};
pub use local::LocalClient;
pub use s3::{S3Client, S3Config};
