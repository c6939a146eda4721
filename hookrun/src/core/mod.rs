//! Deterministic, pure logic shared by the hook engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod hooks;
pub mod replacer;
pub mod result;
pub mod scope;
pub mod signal;
pub mod types;
