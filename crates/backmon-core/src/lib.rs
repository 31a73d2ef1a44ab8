// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Core functionality of the backmon backup-evaluation engine.
//!
//! This crate contains the pure parts of the engine: the pattern language and
//! its compiler, the timestamp assembler, the manifest definition model, the
//! URL-safe alias algorithm, and the cron previous-fire computation. Walking
//! storage trees and publishing metrics live in the service crate.

pub mod alias;
pub mod cron;
pub mod definition;
pub mod pattern;
pub mod timestamp;
pub mod units;

pub use definition::{
    parse_definition, Definition, DefinitionError, DirectoryDefinition, FileDefinition, SortBy,
};
pub use pattern::{
    Conversion, DirectoryFilter, PatternError, VariableDefinition, VariableReference,
};
pub use timestamp::{TimeField, Timestamp};
