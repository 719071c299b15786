//! This crate provides the runtime-agnostic core of a pipelined memcached
//! client: the text and binary protocol engines, the per-connection command
//! queue that binds responses back to their futures, and the idle-timeout
//! state machine. It performs no I/O of its own; an adapter crate (e.g.
//! `memq-tokio`) supplies the transport and the clock.

pub mod binary;
pub mod conn;
pub mod error;
pub mod text;

#[cfg(test)]
pub(crate) mod testutil;
