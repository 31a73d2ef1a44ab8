// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Shared plumbing for the backmon crates.

use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;

pub mod metrics;

/// Load a value from a YAML file located at the provided path.
pub fn load_from_yaml<P: AsRef<Path>, T: DeserializeOwned>(path: P) -> anyhow::Result<T> {
    let path = path.as_ref();
    tracing::debug!(path = %path.display(), "reading from file");

    let reader = std::fs::File::open(path)
        .with_context(|| format!("unable to load config from {}", path.display()))?;

    Ok(serde_yaml::from_reader(reader)?)
}
