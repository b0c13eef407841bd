//! Switchboard - action gateway
//!
//! Accepts action requests (auth, log, mail) and routes each one to a
//! downstream service over HTTP, JSON-RPC, gRPC or an AMQP topic exchange.
//! The listener side consumes log envelopes from the exchange and forwards
//! them to the logger.

pub mod action;
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod lifecycle;
pub mod transport;
pub mod utils;

pub mod proto {
    tonic::include_proto!("logs");
}
