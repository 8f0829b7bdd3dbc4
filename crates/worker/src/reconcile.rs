// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Converges each node panel's inbound/client inventory onto central's,
//! honoring protocol-specific client identity and the start-after-first-use
//! (SAFU) activation policy.

use std::collections::{HashMap, HashSet};

use tracing::{debug, error, info, warn};

use crate::client::PanelHandle;
use crate::now_ms;
use crate::panel::{Client, Inbound, Protocol};

/// Diff central's inventory against every node and push the convergence.
/// Central is read once; a failure to reach it aborts the whole cycle step.
/// Each node is handled independently so one node's failure never affects
/// another.
pub async fn reconcile(central: &PanelHandle, nodes: &[PanelHandle]) {
    let central_inbounds = central.api.list_inbounds().await;
    if central_inbounds.is_empty() {
        error!(panel = %central.url, "no inbounds retrieved from central server, skipping reconciliation");
        return;
    }

    let parsed_central: Vec<(Inbound, Vec<Client>)> =
        central_inbounds.into_iter().map(|ib| { let clients = ib.clients(); (ib, clients) }).collect();

    for node in nodes {
        reconcile_node(central, &parsed_central, node).await;
    }
}

async fn reconcile_node(central: &PanelHandle, parsed_central: &[(Inbound, Vec<Client>)], node: &PanelHandle) {
    let node_inbounds = node.api.list_inbounds().await;
    let mut remaining: HashSet<i64> = node_inbounds.iter().map(|ib| ib.id).collect();

    for (central_inbound, _) in parsed_central {
        if !remaining.remove(&central_inbound.id) {
            if let Err(e) = node.api.add_inbound(central_inbound).await {
                warn!(node = %node.url, inbound = central_inbound.id, err = %e, "failed to add inbound on node");
            }
        } else if let Err(e) = node.api.update_inbound(central_inbound).await {
            warn!(node = %node.url, inbound = central_inbound.id, err = %e, "failed to update inbound on node");
        }
    }
    for stale_id in remaining {
        if let Err(e) = node.api.delete_inbound(stale_id).await {
            warn!(node = %node.url, inbound = stale_id, err = %e, "failed to delete stale inbound on node");
        }
    }

    let now = now_ms();
    for (central_inbound, c_clients) in parsed_central {
        reconcile_clients(central, node, central_inbound, c_clients, &node_inbounds, now).await;
    }
}

async fn reconcile_clients(
    central: &PanelHandle,
    node: &PanelHandle,
    central_inbound: &Inbound,
    c_clients: &[Client],
    node_inbounds: &[Inbound],
    now: i64,
) {
    let protocol = central_inbound.protocol();
    let n_clients =
        node_inbounds.iter().find(|ni| ni.id == central_inbound.id).map(Inbound::clients).unwrap_or_default();

    let mut n_client_map: HashMap<String, Client> =
        n_clients.into_iter().filter_map(|c| c.key(protocol).map(|k| (k, c))).collect();

    // Owned so that a promoted expiry (Case B) mutates the same record that
    // `final_push` pushes to the node, instead of being discarded on a clone.
    let mut c_clients_owned: Vec<Client> = c_clients.to_vec();
    let key_index: HashMap<String, usize> =
        c_clients_owned.iter().enumerate().filter_map(|(i, c)| c.key(protocol).map(|k| (k, i))).collect();

    if c_clients_owned.iter().any(Client::is_fresh_safu) {
        push_fresh_safu(node, central_inbound.id, protocol, &c_clients_owned, &key_index, &n_client_map).await;
    } else {
        promote_from_node(central, central_inbound.id, protocol, &mut c_clients_owned, &key_index, &n_client_map, now)
            .await;
    }

    final_push(node, central_inbound.id, protocol, &c_clients_owned, &mut n_client_map).await;
}

/// Case A: central has a fresh SAFU client for this inbound. Push every
/// fresh SAFU client straight to the node; skip merging node state back
/// toward central entirely for this inbound.
async fn push_fresh_safu(
    node: &PanelHandle,
    inbound_id: i64,
    protocol: Protocol,
    c_clients: &[Client],
    key_index: &HashMap<String, usize>,
    n_client_map: &HashMap<String, Client>,
) {
    for (key, &idx) in key_index {
        let ccl = &c_clients[idx];
        if !ccl.is_fresh_safu() {
            continue;
        }
        match n_client_map.get(key) {
            Some(ncl) => {
                if let Some(nid) = ncl.api_id(protocol) {
                    if let Err(e) = node.api.update_client(inbound_id, &nid, ccl).await {
                        error!(node = %node.url, key, err = %e, "failed to push SAFU client to node");
                    }
                } else {
                    warn!(node = %node.url, key, "node client missing an api id; SAFU push skipped");
                }
            }
            None => {
                if let Err(e) = node.api.add_client(inbound_id, ccl).await {
                    error!(node = %node.url, key, err = %e, "failed to add SAFU client on node");
                }
            }
        }
    }
}

/// Case B: central has no fresh SAFU client for this inbound. Promote a
/// node's already-started expiry back onto central when central hasn't
/// started yet but the node has.
async fn promote_from_node(
    central_target: &PanelHandle,
    inbound_id: i64,
    protocol: Protocol,
    c_clients: &mut [Client],
    key_index: &HashMap<String, usize>,
    n_client_map: &HashMap<String, Client>,
    now: i64,
) {
    for (key, &idx) in key_index {
        let Some(ncl) = n_client_map.get(key) else { continue };
        let central_exp = c_clients[idx].expiry_time;
        let node_exp = ncl.expiry_time;
        let central_started = central_exp > now;
        let node_started = node_exp > now;
        if central_started || !node_started {
            continue;
        }
        let merged = if central_exp <= 0 { node_exp } else { central_exp.min(node_exp) };
        if merged == central_exp || merged <= now {
            continue;
        }
        // Mutate the shared record in place so `final_push` sends the
        // promoted expiry, not the stale pre-merge value.
        c_clients[idx].expiry_time = merged;
        if c_clients[idx].start_after_first_use {
            c_clients[idx].start_after_first_use = false;
        }
        let api_id = c_clients[idx].api_id(protocol).or_else(|| ncl.api_id(protocol));
        let payload = c_clients[idx].clone();
        match api_id {
            Some(id) => match central_target.api.update_client(inbound_id, &id, &payload).await {
                Ok(()) => info!(
                    key,
                    inbound = inbound_id,
                    from = central_exp,
                    to = merged,
                    "promoted expiry from node to central"
                ),
                Err(e) => error!(key, inbound = inbound_id, err = %e, "failed to push SAFU-promoted expiry to central"),
            },
            None => warn!(
                protocol = ?protocol,
                key,
                inbound = inbound_id,
                "missing client id for SAFU merge; central update skipped"
            ),
        }
    }
}

/// Final push (both cases): the central version of every client, after the
/// policy above has run, is the authoritative record pushed to the node.
/// Entries matched here are removed from `n_client_map`'s deletion
/// candidates unconditionally, even when the update call itself fails.
async fn final_push(
    node: &PanelHandle,
    inbound_id: i64,
    protocol: Protocol,
    c_clients: &[Client],
    n_client_map: &mut HashMap<String, Client>,
) {
    for ccl in c_clients {
        let Some(key) = ccl.key(protocol) else { continue };
        match n_client_map.remove(&key) {
            Some(ncl) => match ncl.api_id(protocol) {
                Some(nid) => {
                    if let Err(e) = node.api.update_client(inbound_id, &nid, ccl).await {
                        error!(node = %node.url, key, err = %e, "failed to update client on node");
                    }
                }
                None => warn!(node = %node.url, key, "node client missing an api id; update skipped"),
            },
            None => {
                if let Err(e) = node.api.add_client(inbound_id, ccl).await {
                    error!(node = %node.url, key, err = %e, "failed to add client on node");
                }
            }
        }
    }

    for (key, ncl) in n_client_map.drain() {
        match ncl.api_id(protocol) {
            Some(nid) => {
                if let Err(e) = node.api.delete_client(inbound_id, &nid).await {
                    error!(node = %node.url, key, err = %e, "failed to delete extra client on node");
                }
            }
            None => debug!(node = %node.url, key, "extra node client missing an api id; deletion skipped"),
        }
    }
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
