//! Git hook job execution engine.
//!
//! A hook is a tree of jobs: shell commands, scripts and nested groups that
//! run sequentially, in parallel, or piped (stop after the first failure).
//! The crate keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (scope inheritance, placeholder
//!   expansion and chunking, result aggregation). No I/O.
//! - **[`io`]**: Side-effecting collaborators (git, child processes, file
//!   filtering, configuration). Behind traits where tests need fakes.
//!
//! Orchestration modules ([`command`], [`run`], [`hook`]) combine the two:
//! [`hook::Runner::run_all`] is the entry point for one hook invocation.

pub mod command;
pub mod core;
pub mod exit_codes;
pub mod hook;
pub mod io;
pub mod logging;
pub mod run;
pub mod skip;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
