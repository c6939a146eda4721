//! Stable exit codes for the hookrun CLI.

/// Every job succeeded or was skipped.
pub const OK: i32 = 0;
/// A job failed or the hook run was aborted.
pub const FAILED: i32 = 1;
/// Invalid configuration, repository, or arguments.
pub const INVALID: i32 = 2;
