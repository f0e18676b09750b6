//! Integration tests for the lattice dispatch layer.
//!
//! Test modules:
//!
//! - `cluster_dispatch_tests`: hedged secondary routing, first-to-emit
//!   racing, cursor pinning, fallback-to-primary, and timeout behavior of
//!   the cluster dispatcher
//! - `local_dispatch_tests`: the in-process recursion base, depth budgets,
//!   and redispatcher wiring
//! - `wire_tests`: framed TCP client/server round-trips, streaming order,
//!   error propagation, and cancellation
//! - `mock_infrastructure`: reusable fakes (peer dispatch services,
//!   evaluators, recording dispatchers)
//!
//! Run with:
//!
//! ```bash
//! cargo test --package tests
//! ```


#[cfg(test)]
mod cluster_dispatch_tests;

#[cfg(test)]
mod local_dispatch_tests;
