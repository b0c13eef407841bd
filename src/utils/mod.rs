//! Shared helpers for the binaries and the consumer.

pub mod bootstrap;
pub mod retry;
