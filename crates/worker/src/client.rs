// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP client for a single panel instance: session login, inventory CRUD,
//! and per-client traffic counters.
//!
//! One [`PanelClient`] per panel, cached for the worker's lifetime. Session
//! cookies live in the underlying `reqwest::Client`'s cookie jar; a cheap
//! `inbounds/list` call is used to validate an existing session before
//! paying for a fresh login.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::panel::{Client as PanelClientRecord, Inbound, Panel};

/// The panel capability consumed by the reconciler and aggregator.
/// Abstracted so both can be exercised in tests against an in-memory fake,
/// independent of the concrete HTTP wire shape.
#[async_trait]
pub trait PanelApi: Send + Sync {
    /// Cheap reachability/session check used to decide whether a node takes
    /// part in this cycle at all, without attributing its absence to a
    /// client's traffic counters.
    async fn probe(&self) -> bool;
    async fn list_inbounds(&self) -> Vec<Inbound>;
    async fn add_inbound(&self, inbound: &Inbound) -> anyhow::Result<()>;
    async fn update_inbound(&self, inbound: &Inbound) -> anyhow::Result<()>;
    async fn delete_inbound(&self, inbound_id: i64) -> anyhow::Result<()>;
    async fn add_client(&self, inbound_id: i64, client: &PanelClientRecord) -> anyhow::Result<()>;
    async fn update_client(
        &self,
        inbound_id: i64,
        api_id: &str,
        client: &PanelClientRecord,
    ) -> anyhow::Result<()>;
    async fn delete_client(&self, inbound_id: i64, api_id: &str) -> anyhow::Result<()>;
    async fn get_client_traffic(&self, email: &str) -> (i64, i64);
    async fn update_client_traffic(&self, email: &str, up: i64, down: i64) -> anyhow::Result<()>;
}

/// A panel's identity (its normalized URL, used as the state store key)
/// paired with the capability used to talk to it.
#[derive(Clone)]
pub struct PanelHandle {
    pub url: String,
    pub api: std::sync::Arc<dyn PanelApi>,
}

impl PanelHandle {
    pub fn new(url: impl Into<String>, api: std::sync::Arc<dyn PanelApi>) -> Self {
        Self { url: url.into(), api }
    }
}

/// Tunables that shape how a [`PanelClient`] talks to its panel.
#[derive(Debug, Clone, Copy)]
pub struct PanelClientOptions {
    pub request_timeout: Duration,
    pub validate_ttl: Duration,
    pub connect_pool_size: usize,
}

impl Default for PanelClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            validate_ttl: Duration::from_secs(60),
            connect_pool_size: 50,
        }
    }
}

struct SessionState {
    logged_in: bool,
    last_validated: Option<Instant>,
}

/// Authenticated HTTP client for one panel (central or node).
pub struct PanelClient {
    base_url: String,
    username: String,
    password: String,
    client: Client,
    options: PanelClientOptions,
    session: Mutex<SessionState>,
}

impl PanelClient {
    pub fn new(panel: &Panel, options: PanelClientOptions) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(options.request_timeout)
            .pool_max_idle_per_host(options.connect_pool_size)
            .cookie_store(true)
            .build()?;
        Ok(Self {
            base_url: panel.normalized_url(),
            username: panel.username.clone(),
            password: panel.password.clone(),
            client,
            options,
            session: Mutex::new(SessionState { logged_in: false, last_validated: None }),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn session_fresh(&self) -> bool {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        match (session.logged_in, session.last_validated) {
            (true, Some(at)) => at.elapsed() < self.options.validate_ttl,
            _ => false,
        }
    }

    fn mark_validated(&self) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.logged_in = true;
        session.last_validated = Some(Instant::now());
    }

    fn mark_logged_out(&self) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.logged_in = false;
        session.last_validated = None;
    }

    async fn login(&self) -> anyhow::Result<()> {
        let body = json!({"username": self.username, "password": self.password});
        let resp = self.client.post(self.url("/login")).json(&body).send().await?;
        let value: Value = resp.json().await.unwrap_or(Value::Null);
        if value.get("success").and_then(Value::as_bool) == Some(true) {
            self.mark_validated();
            Ok(())
        } else {
            anyhow::bail!("login rejected by panel {}", self.base_url);
        }
    }

    /// Reuse a session validated within the TTL; otherwise probe with a
    /// lightweight list call, falling back to a fresh login.
    async fn ensure_session(&self) -> anyhow::Result<()> {
        if self.session_fresh() {
            return Ok(());
        }
        let probe = self.client.get(self.url("/panel/api/inbounds/list")).send().await;
        if let Ok(resp) = probe {
            if resp.status().is_success() {
                if let Ok(value) = resp.json::<Value>().await {
                    if value.get("success").and_then(Value::as_bool) == Some(true) {
                        self.mark_validated();
                        return Ok(());
                    }
                }
            }
        }
        self.mark_logged_out();
        self.login().await
    }

    pub async fn list_inbounds(&self) -> Vec<Inbound> {
        if self.ensure_session().await.is_err() {
            return Vec::new();
        }
        let result = self.client.get(self.url("/panel/api/inbounds/list")).send().await;
        let resp = match result {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(panel = %self.base_url, status = %r.status(), "list_inbounds failed");
                return Vec::new();
            }
            Err(e) => {
                warn!(panel = %self.base_url, err = %e, "list_inbounds transport error");
                return Vec::new();
            }
        };
        let value: Value = match resp.json().await {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };
        if value.get("success").and_then(Value::as_bool) != Some(true) {
            return Vec::new();
        }
        value
            .get("obj")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter().filter_map(|v| serde_json::from_value::<Inbound>(v.clone()).ok()).collect()
            })
            .unwrap_or_default()
    }

    pub async fn add_inbound(&self, inbound: &Inbound) -> anyhow::Result<()> {
        self.ensure_session().await?;
        self.post_ok(&self.url("/panel/api/inbounds/add"), &serde_json::to_value(inbound)?).await
    }

    pub async fn update_inbound(&self, inbound: &Inbound) -> anyhow::Result<()> {
        self.ensure_session().await?;
        let path = format!("/panel/api/inbounds/update/{}", inbound.id);
        self.post_ok(&self.url(&path), &serde_json::to_value(inbound)?).await
    }

    pub async fn delete_inbound(&self, inbound_id: i64) -> anyhow::Result<()> {
        self.ensure_session().await?;
        let path = format!("/panel/api/inbounds/del/{inbound_id}");
        self.post_ok(&self.url(&path), &Value::Null).await
    }

    pub async fn add_client(&self, inbound_id: i64, client: &crate::panel::Client) -> anyhow::Result<()> {
        self.ensure_session().await?;
        let body = client_settings_body(inbound_id, client)?;
        self.post_ok(&self.url("/panel/api/inbounds/addClient"), &body).await
    }

    pub async fn update_client(
        &self,
        inbound_id: i64,
        api_id: &str,
        client: &crate::panel::Client,
    ) -> anyhow::Result<()> {
        self.ensure_session().await?;
        let body = client_settings_body(inbound_id, client)?;
        let path = format!("/panel/api/inbounds/updateClient/{}", urlencoding::encode(api_id));
        self.post_ok(&self.url(&path), &body).await
    }

    pub async fn delete_client(&self, inbound_id: i64, api_id: &str) -> anyhow::Result<()> {
        self.ensure_session().await?;
        let path =
            format!("/panel/api/inbounds/{inbound_id}/delClient/{}", urlencoding::encode(api_id));
        self.post_ok(&self.url(&path), &Value::Null).await
    }

    /// `(0, 0)` on any transport/parse error, matching the reference
    /// implementation's fail-open behavior for a single client's traffic.
    pub async fn get_client_traffic(&self, email: &str) -> (i64, i64) {
        if self.ensure_session().await.is_err() {
            return (0, 0);
        }
        let path = format!("/panel/api/inbounds/getClientTraffics/{}", urlencoding::encode(email));
        let result = self.client.get(self.url(&path)).send().await;
        let resp = match result {
            Ok(r) if r.status().is_success() => r,
            _ => return (0, 0),
        };
        let value: Value = match resp.json().await {
            Ok(v) => v,
            Err(_) => return (0, 0),
        };
        if value.get("success").and_then(Value::as_bool) != Some(true) {
            return (0, 0);
        }
        let obj = value.get("obj").cloned().unwrap_or(Value::Null);
        let up = obj.get("up").and_then(Value::as_i64).unwrap_or(0);
        let down = obj.get("down").and_then(Value::as_i64).unwrap_or(0);
        (up, down)
    }

    pub async fn update_client_traffic(&self, email: &str, up: i64, down: i64) -> anyhow::Result<()> {
        self.ensure_session().await?;
        let path = format!("/panel/api/inbounds/updateClientTraffic/{}", urlencoding::encode(email));
        let body = json!({"upload": up, "download": down});
        self.post_ok(&self.url(&path), &body).await
    }

    async fn post_ok(&self, url: &str, body: &Value) -> anyhow::Result<()> {
        let resp = self.client.post(url).json(body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("panel call to {url} returned {}", resp.status());
        }
        Ok(())
    }
}

fn client_settings_body(inbound_id: i64, client: &crate::panel::Client) -> anyhow::Result<Value> {
    let settings = json!({"clients": [client]});
    Ok(json!({"id": inbound_id, "settings": serde_json::to_string(&settings)?}))
}

#[async_trait]
impl PanelApi for PanelClient {
    async fn probe(&self) -> bool {
        self.ensure_session().await.is_ok()
    }

    async fn list_inbounds(&self) -> Vec<Inbound> {
        PanelClient::list_inbounds(self).await
    }

    async fn add_inbound(&self, inbound: &Inbound) -> anyhow::Result<()> {
        PanelClient::add_inbound(self, inbound).await
    }

    async fn update_inbound(&self, inbound: &Inbound) -> anyhow::Result<()> {
        PanelClient::update_inbound(self, inbound).await
    }

    async fn delete_inbound(&self, inbound_id: i64) -> anyhow::Result<()> {
        PanelClient::delete_inbound(self, inbound_id).await
    }

    async fn add_client(&self, inbound_id: i64, client: &PanelClientRecord) -> anyhow::Result<()> {
        PanelClient::add_client(self, inbound_id, client).await
    }

    async fn update_client(
        &self,
        inbound_id: i64,
        api_id: &str,
        client: &PanelClientRecord,
    ) -> anyhow::Result<()> {
        PanelClient::update_client(self, inbound_id, api_id, client).await
    }

    async fn delete_client(&self, inbound_id: i64, api_id: &str) -> anyhow::Result<()> {
        PanelClient::delete_client(self, inbound_id, api_id).await
    }

    async fn get_client_traffic(&self, email: &str) -> (i64, i64) {
        PanelClient::get_client_traffic(self, email).await
    }

    async fn update_client_traffic(&self, email: &str, up: i64, down: i64) -> anyhow::Result<()> {
        PanelClient::update_client_traffic(self, email, up, down).await
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
