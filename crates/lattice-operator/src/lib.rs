//! Lattice BackupStorage operator

#![deny(missing_docs)]

/// Command-line and environment configuration
pub mod config;
/// Builds the BackupStorage controller future
pub mod controller_runner;
/// CRD installation on startup
pub mod startup;
