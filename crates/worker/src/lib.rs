// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fleetsync: reconciles a central panel's inbound/client inventory onto a
//! set of node panels and aggregates per-client traffic across the fleet.

pub mod aggregate;
pub mod client;
pub mod config;
pub mod driver;
pub mod panel;
pub mod reconcile;
pub mod state;

#[cfg(test)]
mod testutil;

pub use driver::run;

/// Current time as milliseconds since the Unix epoch. Falls back to zero if
/// the system clock is set before the epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
