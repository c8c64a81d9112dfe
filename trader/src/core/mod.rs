//! Deterministic, pure logic shared by the trader core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod calendar;
pub mod conversation;
pub mod markets;
pub mod positions;
pub mod scheduler;
pub mod types;
