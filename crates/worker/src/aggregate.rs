// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Aggregates per-client traffic across the fleet into a single monotonic
//! total, tolerating per-panel counter resets via persisted baselines.

use std::collections::HashSet;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::PanelHandle;
use crate::panel::Inbound;
use crate::state::StateStore;

/// Tunables for the read phase's node fan-out.
#[derive(Debug, Clone, Copy)]
pub struct AggregateOptions {
    pub parallel_node_calls: bool,
    pub max_workers: usize,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self { parallel_node_calls: true, max_workers: 8 }
    }
}

/// Read every known client's traffic from central and every reachable node,
/// reconcile it against persisted baselines, and advance each client's total.
pub async fn aggregate(
    central: &PanelHandle,
    nodes: &[PanelHandle],
    store: &StateStore,
    options: AggregateOptions,
) {
    let central_inbounds = central.api.list_inbounds().await;
    if central_inbounds.is_empty() {
        error!(panel = %central.url, "no inbounds retrieved from central server, skipping traffic aggregation");
        return;
    }

    let emails = collect_emails(&central_inbounds);

    let mut healthy_nodes = Vec::with_capacity(nodes.len());
    for node in nodes {
        if node.api.probe().await {
            healthy_nodes.push(node.clone());
        } else {
            warn!(node = %node.url, "failed to reach node, skipping it for this cycle");
        }
    }

    for email in emails {
        if let Err(e) = aggregate_email(central, &healthy_nodes, store, options, &email).await {
            error!(email = %email, err = %e, "error aggregating traffic");
        }
    }
}

/// `clientStats` entries plus every client named in parsed `settings`.
fn collect_emails(inbounds: &[Inbound]) -> HashSet<String> {
    let mut emails = HashSet::new();
    for inbound in inbounds {
        if let Some(stats) = inbound.extra.get("clientStats").and_then(Value::as_array) {
            for stat in stats {
                if let Some(email) = stat.get("email").and_then(Value::as_str) {
                    emails.insert(email.to_owned());
                }
            }
        }
        for client in inbound.clients() {
            if let Some(email) = client.email {
                emails.insert(email);
            }
        }
    }
    emails
}

async fn read_one(node: PanelHandle, email: String) -> (String, i64, i64) {
    let (up, down) = node.api.get_client_traffic(&email).await;
    (node.url, up, down)
}

/// Central first (serial), then every node — concurrently, bounded by
/// `min(#nodes, max_workers)`, or serially when parallel reads are disabled.
async fn read_currents(
    central: &PanelHandle,
    nodes: &[PanelHandle],
    options: AggregateOptions,
    email: &str,
) -> Vec<(String, i64, i64)> {
    let mut currents = Vec::with_capacity(1 + nodes.len());
    let (cu, cd) = central.api.get_client_traffic(email).await;
    currents.push((central.url.clone(), cu, cd));

    if nodes.is_empty() {
        return currents;
    }

    if options.parallel_node_calls {
        let limit = options.max_workers.max(1).min(nodes.len());
        let mut pending = nodes.iter().cloned();
        let mut set = JoinSet::new();
        for node in pending.by_ref().take(limit) {
            set.spawn(read_one(node, email.to_owned()));
        }
        while let Some(res) = set.join_next().await {
            if let Ok(reading) = res {
                currents.push(reading);
            }
            if let Some(node) = pending.next() {
                set.spawn(read_one(node, email.to_owned()));
            }
        }
    } else {
        for node in nodes {
            let (up, down) = node.api.get_client_traffic(email).await;
            currents.push((node.url.clone(), up, down));
        }
    }
    currents
}

/// Write `total` to central and to every node, updating each panel's
/// baseline to the written value as it succeeds.
async fn write_total_everywhere(
    central: &PanelHandle,
    nodes: &[PanelHandle],
    store: &StateStore,
    email: &str,
    up: i64,
    down: i64,
) {
    match central.api.update_client_traffic(email, up, down).await {
        Ok(()) => {
            if let Err(e) = store.set_last_counter(email, &central.url, up, down) {
                error!(email, panel = %central.url, err = %e, "failed to persist central baseline");
            }
        }
        Err(e) => error!(email, panel = %central.url, err = %e, "failed to write total to central"),
    }

    let mut batch = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node.api.update_client_traffic(email, up, down).await {
            Ok(()) => batch.push((node.url.clone(), up, down)),
            Err(e) => error!(email, node = %node.url, err = %e, "failed to write total to node"),
        }
    }
    if !batch.is_empty() {
        if let Err(e) = store.set_last_counters_batch(email, &batch) {
            error!(email, err = %e, "failed to persist node baselines");
        }
    }
}

/// Shared by first-observation and central-reset handling: re-anchor every
/// panel's baseline to its current reading and seed the total from central.
async fn start_new_cycle(
    central: &PanelHandle,
    nodes: &[PanelHandle],
    store: &StateStore,
    email: &str,
    currents: &[(String, i64, i64)],
) -> anyhow::Result<(i64, i64)> {
    let (total_up, total_down) = store.reset_cycle(email, currents, &central.url, crate::now_ms())?;
    write_total_everywhere(central, nodes, store, email, total_up, total_down).await;
    Ok((total_up, total_down))
}

async fn aggregate_email(
    central: &PanelHandle,
    nodes: &[PanelHandle],
    store: &StateStore,
    options: AggregateOptions,
    email: &str,
) -> anyhow::Result<()> {
    let currents = read_currents(central, nodes, options, email).await;
    let (c_up, c_down) =
        currents.iter().find(|(url, _, _)| *url == central.url).map(|(_, u, d)| (*u, *d)).unwrap_or((0, 0));

    let last_central = store.get_last_counter(email, &central.url)?;

    let Some((last_cu, last_cd)) = last_central else {
        let (total_up, total_down) = start_new_cycle(central, nodes, store, email, &currents).await?;
        info!(
            email,
            up = total_up,
            down = total_down,
            "first observation: total set to central current, baselines aligned"
        );
        return Ok(());
    };

    if c_up < last_cu || c_down < last_cd {
        let (total_up, total_down) = start_new_cycle(central, nodes, store, email, &currents).await?;
        warn!(email, up = total_up, down = total_down, "central counter reset: cycle restarted");
        return Ok(());
    }

    let (mut total_up, mut total_down) = store.get_total(email)?;
    let mut added_up = 0i64;
    let mut added_down = 0i64;

    for (panel_url, cur_up, cur_down) in &currents {
        let baseline = store.get_last_counter(email, panel_url)?;
        let Some((base_up, base_down)) = baseline else {
            store.set_last_counter(email, panel_url, *cur_up, *cur_down)?;
            continue;
        };

        let (du, dd) = if *cur_up >= base_up && *cur_down >= base_down {
            (*cur_up - base_up, *cur_down - base_down)
        } else {
            warn!(
                email,
                panel = %panel_url,
                last_up = base_up,
                last_down = base_down,
                cur_up,
                cur_down,
                "per-panel counter reset: delta taken as current value"
            );
            (*cur_up, *cur_down)
        };

        if du > 0 || dd > 0 {
            added_up += du;
            added_down += dd;
            store.add_node_delta(email, panel_url, du, dd)?;
        }
    }

    if added_up == 0 && added_down == 0 {
        return Ok(());
    }

    total_up += added_up;
    total_down += added_down;
    let changed = store.set_total(email, total_up, total_down)?;
    if changed {
        write_total_everywhere(central, nodes, store, email, total_up, total_down).await;
        debug!(email, added_up, added_down, total_up, total_down, "traffic delta committed");
    }
    Ok(())
}

#[cfg(test)]
#[path = "aggregate_tests.rs"]
mod tests;
