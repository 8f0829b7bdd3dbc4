// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn store() -> anyhow::Result<StateStore> {
    StateStore::open_in_memory()
}

#[test]
fn unknown_client_total_defaults_to_zero() -> anyhow::Result<()> {
    let s = store()?;
    assert_eq!(s.get_total("a@x")?, (0, 0));
    Ok(())
}

#[test]
fn set_total_round_trips() -> anyhow::Result<()> {
    let s = store()?;
    assert!(s.set_total("a@x", 10, 20)?);
    assert_eq!(s.get_total("a@x")?, (10, 20));
    Ok(())
}

#[test]
fn set_total_is_idempotent_on_unchanged_value() -> anyhow::Result<()> {
    let s = store()?;
    assert!(s.set_total("a@x", 10, 20)?);
    assert!(!s.set_total("a@x", 10, 20)?);
    Ok(())
}

#[test]
fn cycle_started_at_does_not_clobber_totals() -> anyhow::Result<()> {
    let s = store()?;
    s.set_total("a@x", 5, 5)?;
    s.set_cycle_started_at("a@x", 1000)?;
    assert_eq!(s.get_total("a@x")?, (5, 5));
    Ok(())
}

#[test]
fn unknown_counter_is_none() -> anyhow::Result<()> {
    let s = store()?;
    assert_eq!(s.get_last_counter("a@x", "https://central")?, None);
    Ok(())
}

#[test]
fn last_counter_round_trips_per_panel() -> anyhow::Result<()> {
    let s = store()?;
    s.set_last_counter("a@x", "https://central", 1, 2)?;
    s.set_last_counter("a@x", "https://node1", 3, 4)?;
    assert_eq!(s.get_last_counter("a@x", "https://central")?, Some((1, 2)));
    assert_eq!(s.get_last_counter("a@x", "https://node1")?, Some((3, 4)));
    Ok(())
}

#[test]
fn set_last_counters_batch_is_atomic_and_complete() -> anyhow::Result<()> {
    let s = store()?;
    s.set_last_counters_batch(
        "a@x",
        &[("https://central".to_owned(), 1, 1), ("https://node1".to_owned(), 2, 2)],
    )?;
    assert_eq!(s.get_last_counter("a@x", "https://central")?, Some((1, 1)));
    assert_eq!(s.get_last_counter("a@x", "https://node1")?, Some((2, 2)));
    Ok(())
}

fn node_totals_row(s: &StateStore, email: &str, node_url: &str) -> anyhow::Result<(i64, i64)> {
    let conn = s.lock();
    let row = conn
        .query_row(
            "SELECT up_total, down_total FROM node_totals WHERE email = ?1 AND node_url = ?2",
            params![email, node_url],
            |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(row.unwrap_or((0, 0)))
}

fn node_totals_row_count(s: &StateStore, email: &str) -> anyhow::Result<i64> {
    let conn = s.lock();
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM node_totals WHERE email = ?1",
        params![email],
        |r| r.get(0),
    )?)
}

#[test]
fn add_node_delta_accumulates() -> anyhow::Result<()> {
    let s = store()?;
    s.add_node_delta("a@x", "https://node1", 10, 20)?;
    s.add_node_delta("a@x", "https://node1", 5, 0)?;
    assert_eq!(node_totals_row(&s, "a@x", "https://node1")?, (15, 20));
    Ok(())
}

#[test]
fn add_node_delta_is_a_noop_for_zero_zero() -> anyhow::Result<()> {
    let s = store()?;
    s.add_node_delta("a@x", "https://node1", 0, 0)?;
    assert_eq!(node_totals_row_count(&s, "a@x")?, 0);
    Ok(())
}

#[test]
fn reset_node_totals_clears_only_that_email() -> anyhow::Result<()> {
    let s = store()?;
    s.add_node_delta("a@x", "https://node1", 1, 1)?;
    s.add_node_delta("b@x", "https://node1", 2, 2)?;
    s.reset_node_totals("a@x")?;
    assert_eq!(node_totals_row_count(&s, "a@x")?, 0);
    assert_eq!(node_totals_row_count(&s, "b@x")?, 1);
    Ok(())
}

#[test]
fn reset_cycle_aligns_baselines_and_seeds_total_from_central() -> anyhow::Result<()> {
    let s = store()?;
    s.add_node_delta("a@x", "https://node1", 99, 99)?;
    let (cup, cdown) = s.reset_cycle(
        "a@x",
        &[("https://central".to_owned(), 100, 200), ("https://node1".to_owned(), 50, 60)],
        "https://central",
        12345,
    )?;
    assert_eq!((cup, cdown), (100, 200));
    assert_eq!(s.get_total("a@x")?, (100, 200));
    assert_eq!(s.get_last_counter("a@x", "https://central")?, Some((100, 200)));
    assert_eq!(s.get_last_counter("a@x", "https://node1")?, Some((50, 60)));
    assert_eq!(node_totals_row_count(&s, "a@x")?, 0, "reset_cycle must clear node_totals for the email");
    Ok(())
}

#[test]
fn reset_cycle_defaults_to_zero_when_central_panel_absent_from_readings() -> anyhow::Result<()> {
    let s = store()?;
    let (cup, cdown) =
        s.reset_cycle("a@x", &[("https://node1".to_owned(), 50, 60)], "https://central", 1)?;
    assert_eq!((cup, cdown), (0, 0));
    Ok(())
}

#[test]
fn sync_mode_parse_accepts_known_values_case_insensitively() {
    assert_eq!(SyncMode::parse("normal"), Some(SyncMode::Normal));
    assert_eq!(SyncMode::parse("FULL"), Some(SyncMode::Full));
    assert_eq!(SyncMode::parse("Off"), Some(SyncMode::Off));
    assert_eq!(SyncMode::parse("bogus"), None);
}
