//! Framed peer transport: the dispatcher is its own client.
//!
//! Peer RPC uses length-delimited frames over TCP ([`framing`]); payloads
//! are the serde envelopes of [`proto`]. [`client::WireDispatchClient`]
//! implements the [`crate::dispatch::DispatchClient`] contract the cluster
//! dispatcher consumes, and [`server::serve`] exposes any
//! [`crate::dispatch::Dispatcher`] to peers. Streaming operations are
//! server-streamed as item frames terminated by a `Done` or `Error` frame.

pub mod client;
pub mod framing;
pub mod proto;
pub mod server;

pub use client::WireDispatchClient;
pub use framing::{FrameCodec, FrameError, MAX_FRAME_SIZE};
pub use server::{serve, serve_connection};
