// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end exercise of a full cycle (reconcile then aggregate) against an
//! in-memory fleet: one central panel, one node starting from empty
//! inventory, converging and then accumulating traffic across two ticks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use fleetsync::aggregate::{aggregate, AggregateOptions};
use fleetsync::client::{PanelApi, PanelHandle};
use fleetsync::panel::{Client, Inbound};
use fleetsync::reconcile::reconcile;
use fleetsync::state::StateStore;
use serde_json::json;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct MemPanel {
    inbounds: Mutex<Vec<Inbound>>,
    traffic: Mutex<HashMap<String, (i64, i64)>>,
}

impl MemPanel {
    fn new_empty() -> Self {
        Self::default()
    }

    fn with_inbounds(inbounds: Vec<Inbound>) -> Self {
        Self { inbounds: Mutex::new(inbounds), ..Default::default() }
    }

    fn set_traffic(&self, email: &str, up: i64, down: i64) {
        lock(&self.traffic).insert(email.to_owned(), (up, down));
    }

    fn clients_of(&self, inbound_id: i64) -> Vec<Client> {
        lock(&self.inbounds).iter().find(|ib| ib.id == inbound_id).map(Inbound::clients).unwrap_or_default()
    }
}

fn set_clients(inbound: &mut Inbound, clients: &[Client]) -> anyhow::Result<()> {
    inbound.settings = serde_json::to_string(&json!({"clients": clients}))?;
    Ok(())
}

#[async_trait]
impl PanelApi for MemPanel {
    async fn probe(&self) -> bool {
        true
    }

    async fn list_inbounds(&self) -> Vec<Inbound> {
        lock(&self.inbounds).clone()
    }

    async fn add_inbound(&self, inbound: &Inbound) -> anyhow::Result<()> {
        lock(&self.inbounds).push(inbound.clone());
        Ok(())
    }

    async fn update_inbound(&self, inbound: &Inbound) -> anyhow::Result<()> {
        let mut inbounds = lock(&self.inbounds);
        if let Some(existing) = inbounds.iter_mut().find(|ib| ib.id == inbound.id) {
            *existing = inbound.clone();
        }
        Ok(())
    }

    async fn delete_inbound(&self, inbound_id: i64) -> anyhow::Result<()> {
        lock(&self.inbounds).retain(|ib| ib.id != inbound_id);
        Ok(())
    }

    async fn add_client(&self, inbound_id: i64, client: &Client) -> anyhow::Result<()> {
        let mut inbounds = lock(&self.inbounds);
        let Some(inbound) = inbounds.iter_mut().find(|ib| ib.id == inbound_id) else {
            anyhow::bail!("unknown inbound {inbound_id}");
        };
        let mut clients = inbound.clients();
        clients.push(client.clone());
        set_clients(inbound, &clients)
    }

    async fn update_client(&self, inbound_id: i64, api_id: &str, client: &Client) -> anyhow::Result<()> {
        let mut inbounds = lock(&self.inbounds);
        let Some(inbound) = inbounds.iter_mut().find(|ib| ib.id == inbound_id) else {
            anyhow::bail!("unknown inbound {inbound_id}");
        };
        let protocol = inbound.protocol();
        let mut clients = inbound.clients();
        if let Some(slot) = clients.iter_mut().find(|c| c.api_id(protocol).as_deref() == Some(api_id)) {
            *slot = client.clone();
        } else {
            anyhow::bail!("client {api_id} not found");
        }
        set_clients(inbound, &clients)
    }

    async fn delete_client(&self, inbound_id: i64, api_id: &str) -> anyhow::Result<()> {
        let mut inbounds = lock(&self.inbounds);
        let Some(inbound) = inbounds.iter_mut().find(|ib| ib.id == inbound_id) else {
            anyhow::bail!("unknown inbound {inbound_id}");
        };
        let protocol = inbound.protocol();
        let mut clients = inbound.clients();
        clients.retain(|c| c.api_id(protocol).as_deref() != Some(api_id));
        set_clients(inbound, &clients)
    }

    async fn get_client_traffic(&self, email: &str) -> (i64, i64) {
        lock(&self.traffic).get(email).copied().unwrap_or((0, 0))
    }

    async fn update_client_traffic(&self, email: &str, up: i64, down: i64) -> anyhow::Result<()> {
        lock(&self.traffic).insert(email.to_owned(), (up, down));
        Ok(())
    }
}

fn vless_client(email: &str, id: &str) -> Client {
    Client {
        email: Some(email.to_owned()),
        id: Some(id.to_owned()),
        password: None,
        expiry_time: 0,
        start_after_first_use: false,
        extra: serde_json::Map::new(),
    }
}

fn inbound(id: i64, clients: Vec<Client>) -> Inbound {
    Inbound {
        id,
        protocol: "vless".to_owned(),
        settings: serde_json::to_string(&json!({"clients": clients})).unwrap_or_default(),
        extra: serde_json::Map::new(),
    }
}

fn handle(panel: Arc<MemPanel>, url: &str) -> PanelHandle {
    PanelHandle::new(url, panel)
}

#[tokio::test]
async fn full_cycle_converges_inventory_then_accumulates_traffic_across_two_ticks() -> anyhow::Result<()> {
    let central_panel =
        Arc::new(MemPanel::with_inbounds(vec![inbound(1, vec![vless_client("a@x", "id-a")])]));
    let node_panel = Arc::new(MemPanel::new_empty());
    let central = handle(central_panel.clone(), "https://central");
    let node = handle(node_panel.clone(), "https://node1");
    let store = StateStore::open_in_memory()?;
    let options = AggregateOptions::default();

    // Tick 1: node starts empty, must converge to central's inventory, and
    // the first traffic observation seeds the baseline with no delta yet.
    central_panel.set_traffic("a@x", 100, 200);
    reconcile(&central, std::slice::from_ref(&node)).await;
    aggregate(&central, std::slice::from_ref(&node), &store, options).await;

    assert_eq!(node_panel.clients_of(1).len(), 1);
    assert_eq!(node_panel.clients_of(1)[0].id.as_deref(), Some("id-a"));
    assert_eq!(store.get_total("a@x")?, (100, 200));

    // Tick 2: both panels accumulate traffic; the total must be the sum of
    // each panel's delta since its own last-recorded baseline.
    central_panel.set_traffic("a@x", 150, 260);
    node_panel.set_traffic("a@x", 30, 40);
    reconcile(&central, std::slice::from_ref(&node)).await;
    aggregate(&central, std::slice::from_ref(&node), &store, options).await;

    assert_eq!(store.get_total("a@x")?, (100 + 50 + 30, 200 + 60 + 40));
    Ok(())
}
