//! Duplicate file detection with a persistent fingerprint cache.
//!
//! A run walks one root (or a source and a target root), fingerprints every
//! regular file with a bounded worker pool, records each fingerprint in a
//! SQLite cache through a single writer, and reports files whose content
//! matches as a CSV of primary/duplicate pairs.

pub mod db;
pub mod digest;
pub mod hasher;
pub mod matcher;
pub mod params;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod report;
pub mod settings;
pub mod verify;
pub mod walker;

pub use params::{ExecutionParams, RawParams, ValidationError};
pub use pipeline::{Pipeline, RunSummary};
pub use settings::Settings;
