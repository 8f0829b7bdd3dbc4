// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Domain model shared by the reconciler, aggregator, and panel client:
//! panels, inbounds, clients, and protocol-specific identity rules.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A remote control-plane instance (central or node).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Panel {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl Panel {
    /// Normalize the panel's URL by trimming a trailing path separator.
    /// The normalized URL is the panel's identity key.
    pub fn normalized_url(&self) -> String {
        self.url.trim_end_matches('/').to_owned()
    }
}

/// Protocol carried by an inbound. Determines client identity rules (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Other,
}

impl Protocol {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "vmess" => Self::Vmess,
            "vless" => Self::Vless,
            "trojan" => Self::Trojan,
            "shadowsocks" => Self::Shadowsocks,
            _ => Self::Other,
        }
    }
}

/// An ingress endpoint on a panel. `settings` is the raw JSON-encoded string
/// the panel stores; it is parsed lazily via [`Inbound::clients`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbound {
    pub id: i64,
    pub protocol: String,
    #[serde(default)]
    pub settings: String,
    /// Every other panel-defined field, preserved verbatim on writes.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Inbound {
    pub fn protocol(&self) -> Protocol {
        Protocol::parse(&self.protocol)
    }

    /// Parse `settings` and return its `clients` array. Malformed or absent
    /// settings yield an empty list rather than failing the cycle.
    pub fn clients(&self) -> Vec<Client> {
        let Ok(parsed) = serde_json::from_str::<Value>(&self.settings) else {
            return Vec::new();
        };
        let Some(list) = parsed.get("clients").and_then(Value::as_array) else {
            return Vec::new();
        };
        list.iter()
            .filter_map(|v| serde_json::from_value::<Client>(v.clone()).ok())
            .collect()
    }
}

/// A subscriber record scoped to an inbound. `extra` carries every
/// panel-defined field this model does not name explicitly; it must survive
/// round-trips through add/update calls unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub email: Option<String>,
    pub id: Option<String>,
    pub password: Option<String>,
    #[serde(rename = "expiryTime", default)]
    pub expiry_time: i64,
    #[serde(rename = "startAfterFirstUse", default)]
    pub start_after_first_use: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Client {
    /// A fresh SAFU client is waiting for first use.
    pub fn is_fresh_safu(&self) -> bool {
        self.start_after_first_use && self.expiry_time <= 0
    }

    /// Identity used to match this client across central and node (§4.2).
    pub fn key(&self, protocol: Protocol) -> Option<String> {
        match protocol {
            Protocol::Trojan => self
                .password
                .clone()
                .or_else(|| self.email.clone())
                .or_else(|| self.id.clone()),
            Protocol::Shadowsocks => self.email.clone(),
            Protocol::Vmess | Protocol::Vless | Protocol::Other => {
                self.id.clone().or_else(|| self.email.clone())
            }
        }
    }

    /// Identifier used in update/delete endpoints for this protocol (§4.2).
    pub fn api_id(&self, protocol: Protocol) -> Option<String> {
        match protocol {
            Protocol::Trojan => self.password.clone(),
            Protocol::Shadowsocks => self.email.clone(),
            Protocol::Vmess | Protocol::Vless | Protocol::Other => self.id.clone(),
        }
    }
}

#[cfg(test)]
#[path = "panel_tests.rs"]
mod tests;
