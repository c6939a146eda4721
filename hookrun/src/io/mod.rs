//! Side-effecting collaborators: git, child processes, filesystem, config.

pub mod config;
pub mod executor;
pub mod filter;
pub mod git;
pub mod process;
pub mod repository;
