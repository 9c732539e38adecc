//! # Transport
//!
//! Real-time fan-out of progress, log and status events to connected observers. The
//! concrete transport (websocket, SSE) lives outside the core and plugs in as a
//! [`TransportSink`].

pub mod broadcaster;

pub use broadcaster::{ConnectionId, TransportBroadcaster, TransportMessage, TransportSink};
