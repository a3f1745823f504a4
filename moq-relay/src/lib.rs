//! Media-over-QUIC live-streaming relay: the channel/audience registries,
//! the session router, and the transport-level tracer and rate-adaptation
//! controller that drive it. The binary in `main.rs` is a thin CLI shell
//! around this library so the router's logic can be exercised directly in
//! tests, against a fake transport, with no QUIC stack involved.

pub mod audience;
pub mod channel;
pub mod error;
pub mod index;
pub mod session;
pub mod tracer;
pub mod transport;
pub mod web;
