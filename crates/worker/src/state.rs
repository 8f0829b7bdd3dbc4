// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable local state: per-client traffic totals, per-(client,panel)
//! baselines, and per-(client,node) cycle accumulations.
//!
//! Backed by a single SQLite file behind one [`std::sync::Mutex`] — the
//! single writer lock the consistency model depends on. All reads and
//! writes go through this connection; there is no separate reader pool.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// `db.synchronous` pragma value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Normal,
    Off,
}

impl SyncMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "FULL" => Some(Self::Full),
            "NORMAL" => Some(Self::Normal),
            "OFF" => Some(Self::Off),
            _ => None,
        }
    }

    fn as_pragma(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Normal => "NORMAL",
            Self::Off => "OFF",
        }
    }
}

/// Durability knobs for [`StateStore::open`], mirroring `db.*` config.
#[derive(Debug, Clone, Copy)]
pub struct StateStoreOptions {
    pub wal: bool,
    pub synchronous: SyncMode,
    pub cache_size_mb: u32,
}

impl Default for StateStoreOptions {
    fn default() -> Self {
        Self { wal: true, synchronous: SyncMode::Normal, cache_size_mb: 20 }
    }
}

/// Durable key-value store of `client_totals`, `server_counters`, and
/// `node_totals`.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>, opts: StateStoreOptions) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening state database at {}", path.as_ref().display()))?;
        conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")?;
        if opts.wal {
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        }
        conn.execute_batch(&format!("PRAGMA synchronous={};", opts.synchronous.as_pragma()))?;
        conn.execute_batch(&format!(
            "PRAGMA cache_size=-{}; PRAGMA temp_store=MEMORY;",
            (opts.cache_size_mb as i64) * 1024
        ))?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS client_totals (
                email TEXT PRIMARY KEY,
                total_up INTEGER NOT NULL DEFAULT 0,
                total_down INTEGER NOT NULL DEFAULT 0,
                cycle_started_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS server_counters (
                email TEXT NOT NULL,
                panel_url TEXT NOT NULL,
                last_up INTEGER NOT NULL DEFAULT 0,
                last_down INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (email, panel_url)
            );
            CREATE TABLE IF NOT EXISTS node_totals (
                email TEXT NOT NULL,
                node_url TEXT NOT NULL,
                up_total INTEGER NOT NULL DEFAULT 0,
                down_total INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (email, node_url)
            );
            CREATE INDEX IF NOT EXISTS idx_node_totals_email ON node_totals(email);",
        )?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get_total(&self, email: &str) -> Result<(i64, i64)> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT total_up, total_down FROM client_totals WHERE email = ?1",
                params![email],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row.unwrap_or((0, 0)))
    }

    /// Idempotent: no write and returns `false` when the stored pair already
    /// equals `(up, down)`.
    pub fn set_total(&self, email: &str, up: i64, down: i64) -> Result<bool> {
        let conn = self.lock();
        let current = conn
            .query_row(
                "SELECT total_up, total_down FROM client_totals WHERE email = ?1",
                params![email],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
            )
            .optional()?;
        if current == Some((up, down)) {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO client_totals(email, total_up, total_down, cycle_started_at)
             VALUES (?1, ?2, ?3, (SELECT cycle_started_at FROM client_totals WHERE email = ?1))
             ON CONFLICT(email) DO UPDATE SET total_up = excluded.total_up, total_down = excluded.total_down",
            params![email, up, down],
        )?;
        Ok(true)
    }

    pub fn set_cycle_started_at(&self, email: &str, ts: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO client_totals(email, total_up, total_down, cycle_started_at)
             VALUES (?1, 0, 0, ?2)
             ON CONFLICT(email) DO UPDATE SET cycle_started_at = excluded.cycle_started_at",
            params![email, ts],
        )?;
        Ok(())
    }

    pub fn get_last_counter(&self, email: &str, panel_url: &str) -> Result<Option<(i64, i64)>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT last_up, last_down FROM server_counters WHERE email = ?1 AND panel_url = ?2",
                params![email, panel_url],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Idempotent: no write and returns `false` when the stored pair already
    /// equals `(up, down)`.
    pub fn set_last_counter(&self, email: &str, panel_url: &str, up: i64, down: i64) -> Result<bool> {
        let conn = self.lock();
        Self::upsert_counter(&conn, email, panel_url, up, down)
    }

    fn upsert_counter(conn: &Connection, email: &str, panel_url: &str, up: i64, down: i64) -> Result<bool> {
        let current = conn
            .query_row(
                "SELECT last_up, last_down FROM server_counters WHERE email = ?1 AND panel_url = ?2",
                params![email, panel_url],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
            )
            .optional()?;
        if current == Some((up, down)) {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO server_counters(email, panel_url, last_up, last_down)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(email, panel_url) DO UPDATE SET last_up = excluded.last_up, last_down = excluded.last_down",
            params![email, panel_url, up, down],
        )?;
        Ok(true)
    }

    /// Single atomic batch write of baselines for one email across panels.
    pub fn set_last_counters_batch(&self, email: &str, items: &[(String, i64, i64)]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for (panel_url, up, down) in items {
            tx.execute(
                "INSERT INTO server_counters(email, panel_url, last_up, last_down)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(email, panel_url) DO UPDATE SET last_up = excluded.last_up, last_down = excluded.last_down",
                params![email, panel_url, up, down],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// No-op when both components are zero; otherwise increments the row
    /// (inserting it if absent).
    pub fn add_node_delta(&self, email: &str, node_url: &str, du: i64, dd: i64) -> Result<()> {
        if du == 0 && dd == 0 {
            return Ok(());
        }
        let conn = self.lock();
        conn.execute(
            "INSERT INTO node_totals(email, node_url, up_total, down_total)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(email, node_url) DO UPDATE SET
                up_total = node_totals.up_total + excluded.up_total,
                down_total = node_totals.down_total + excluded.down_total",
            params![email, node_url, du, dd],
        )?;
        Ok(())
    }

    pub fn reset_node_totals(&self, email: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM node_totals WHERE email = ?1", params![email])?;
        Ok(())
    }

    /// Atomically: clear `node_totals` for `email`, set `client_totals` to
    /// central's current reading (or zero), and align every panel's
    /// baseline to its current reading.
    pub fn reset_cycle(
        &self,
        email: &str,
        currents_by_panel: &[(String, i64, i64)],
        central_panel: &str,
        now: i64,
    ) -> Result<(i64, i64)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let (cup, cdown) = currents_by_panel
            .iter()
            .find(|(url, _, _)| url == central_panel)
            .map(|(_, u, d)| (*u, *d))
            .unwrap_or((0, 0));

        tx.execute("DELETE FROM node_totals WHERE email = ?1", params![email])?;
        tx.execute(
            "INSERT INTO client_totals(email, total_up, total_down, cycle_started_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(email) DO UPDATE SET
                total_up = excluded.total_up, total_down = excluded.total_down, cycle_started_at = excluded.cycle_started_at",
            params![email, cup, cdown, now],
        )?;
        for (panel_url, up, down) in currents_by_panel {
            tx.execute(
                "INSERT INTO server_counters(email, panel_url, last_up, last_down)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(email, panel_url) DO UPDATE SET last_up = excluded.last_up, last_down = excluded.last_down",
                params![email, panel_url, up, down],
            )?;
        }
        tx.commit()?;
        Ok((cup, cdown))
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
