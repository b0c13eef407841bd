//! Service entry points built on the dispatch core.
//!
//! - `gateway`: HTTP surface accepting inbound action requests
//! - `listener`: consumer handler forwarding log envelopes to the logger

pub mod gateway;
pub mod listener;
