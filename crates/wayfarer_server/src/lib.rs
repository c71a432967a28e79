#![forbid(unsafe_code)]

//! Server side of the wayfarer chat protocol: QUIC endpoint, per-connection
//! session handling, room fan-out, and the op handlers that keep room and
//! message invariants intact under concurrent sessions.

pub mod config;
pub mod quic;
pub mod server;
