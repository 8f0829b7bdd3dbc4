// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory fake panel shared by the reconciler and aggregator test suites.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::json;

use crate::client::PanelApi;
use crate::panel::{Client, Inbound};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub struct FakePanel {
    inbounds: Mutex<Vec<Inbound>>,
    traffic: Mutex<HashMap<String, (i64, i64)>>,
    fail_traffic_reads: Mutex<HashSet<String>>,
    pub traffic_writes: Mutex<Vec<(String, i64, i64)>>,
    unreachable: Mutex<bool>,
}

impl FakePanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inbounds(inbounds: Vec<Inbound>) -> Self {
        Self { inbounds: Mutex::new(inbounds), ..Default::default() }
    }

    pub fn set_traffic(&self, email: &str, up: i64, down: i64) {
        lock(&self.traffic).insert(email.to_owned(), (up, down));
    }

    pub fn fail_traffic_for(&self, email: &str) {
        lock(&self.fail_traffic_reads).insert(email.to_owned());
    }

    pub fn mark_unreachable(&self) {
        *lock(&self.unreachable) = true;
    }

    pub fn inbounds_snapshot(&self) -> Vec<Inbound> {
        lock(&self.inbounds).clone()
    }

    pub fn clients_of(&self, inbound_id: i64) -> Vec<Client> {
        self.inbounds_snapshot()
            .into_iter()
            .find(|ib| ib.id == inbound_id)
            .map(|ib| ib.clients())
            .unwrap_or_default()
    }
}

fn set_clients(inbound: &mut Inbound, clients: &[Client]) -> anyhow::Result<()> {
    inbound.settings = serde_json::to_string(&json!({"clients": clients}))?;
    Ok(())
}

#[async_trait]
impl PanelApi for FakePanel {
    async fn probe(&self) -> bool {
        !*lock(&self.unreachable)
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
            anyhow::bail!("client {api_id} not found on inbound {inbound_id}");
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
        if lock(&self.fail_traffic_reads).contains(email) {
            return (0, 0);
        }
        lock(&self.traffic).get(email).copied().unwrap_or((0, 0))
    }

    async fn update_client_traffic(&self, email: &str, up: i64, down: i64) -> anyhow::Result<()> {
        lock(&self.traffic_writes).push((email.to_owned(), up, down));
        lock(&self.traffic).insert(email.to_owned(), (up, down));
        Ok(())
    }
}
