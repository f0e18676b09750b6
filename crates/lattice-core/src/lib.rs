//! # Lattice Core
//!
//! Core library for the lattice permissions service: the dispatch layer
//! that resolves permission queries over a relationship graph by fanning
//! sub-queries out across a cluster of peer servers.
//!
//! This crate provides:
//!
//! - **[`dispatch`]**: the [`dispatch::Dispatcher`] contract plus its two
//!   implementations — [`dispatch::LocalDispatcher`] (in-process recursion
//!   base over an evaluation engine) and [`dispatch::ClusterDispatcher`]
//!   (primary routing with hedged secondaries, first-to-emit racing, and
//!   cursor-pinned streaming continuations).
//!
//! - **[`wire`]**: the framed peer transport. The dispatcher is its own
//!   client: a [`wire::WireDispatchClient`] speaks the same protocol
//!   [`wire::serve`] exposes.
//!
//! - **[`config`]**: layered TOML + environment configuration with
//!   load-time validation.
//!
//! - **[`types`]**: the request/response payloads exchanged with the
//!   evaluation engine and peers.
//!
//! ## Dispatch Flow
//!
//! ```text
//! Service Layer
//!       │
//!       ▼
//! ┌───────────────────┐   expression selects secondaries
//! │ ClusterDispatcher │────────────────┐
//! └───────┬───────────┘                │
//!         ▼                            ▼
//!   primary peer ──race──────── hedged secondary
//!         │    first-to-emit wins      │
//!         └──────────┬─────────────────┘
//!                    ▼
//!          caller's DispatchStream
//!          (cursors pinned to the producing secondary)
//! ```
//!
//! Depth budgets, deadlines, and cancellation propagate through
//! [`dispatch::Context`]; the error taxonomy lives in
//! [`dispatch::DispatchError`].

pub mod config;
pub mod dispatch;
pub mod types;
pub mod wire;
