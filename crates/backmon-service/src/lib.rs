// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The backmon monitoring service.
//!
//! The service periodically enumerates the disks of every configured
//! environment, evaluates each disk's backups against its manifest, and
//! publishes the result as prometheus gauges and a small read-only JSON API.

pub mod config;
pub mod metrics;
pub mod monitor;
pub mod server;
