//! Standard exit codes for CLI operations
//!
//! These exit codes follow Unix conventions where applicable.

/// General error - unspecified failure (e.g. the cluster is unreachable)
pub const ERROR: i32 = 1;

/// Definition error - the file is not a valid ResourceGraphDefinition
pub const DEFINITION_ERROR: i32 = 2;

/// Compile error - the graph is invalid (unknown reference, cycle, bad schema)
pub const COMPILE_ERROR: i32 = 3;

/// Configuration error - invalid controller configuration
pub const CONFIG_ERROR: i32 = 4;

/// IO error - file not found, permission denied, etc.
pub const IO_ERROR: i32 = 5;
