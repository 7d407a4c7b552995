//! Client configuration.

use serde::{Deserialize, Serialize};
use smbengine_codec::Dialect;
use uuid::Uuid;

use crate::error::{ClientError, Result};

/// Tunables shared by every connection a client opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Dialect codes offered at negotiation, most preferred first.
    pub dialects: Vec<u16>,
    /// Set SIGNING_REQUIRED and sign every session request.
    pub require_signing: bool,
    /// Encrypt every session's traffic even when the server does not ask for it.
    pub encrypt: bool,
    /// Cipher identifiers offered, most preferred first.
    pub ciphers: Vec<u16>,
    /// Signing algorithm identifiers offered (3.1.1), most preferred first.
    pub signing_algorithms: Vec<u16>,
    /// Credits requested per request; raised to the request's charge when lower.
    pub credit_request: u16,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Bounded wait used by `transceive` in milliseconds.
    pub request_timeout_ms: u64,
    /// Largest accepted inbound frame payload.
    pub max_frame_size: u32,
    /// Client identifier; generated once per client when absent.
    pub client_guid: Option<Uuid>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dialects: Dialect::ALL.iter().map(|d| *d as u16).collect(),
            require_signing: false,
            encrypt: false,
            ciphers: vec![0x0002, 0x0001, 0x0004, 0x0003],
            signing_algorithms: vec![0x0002, 0x0001, 0x0000],
            credit_request: 64,
            connect_timeout_ms: 5000,
            request_timeout_ms: 30_000,
            max_frame_size: 16 * 1024 * 1024,
            client_guid: None,
        }
    }
}

impl ClientConfig {
    /// The offered dialects, validated.
    pub fn dialects(&self) -> Result<Vec<Dialect>> {
        if self.dialects.is_empty() {
            return Err(ClientError::request("no dialects configured"));
        }
        self.dialects
            .iter()
            .map(|code| Dialect::try_from(*code).map_err(ClientError::from))
            .collect()
    }

    /// Credits to request for a request charging `charge`.
    pub fn credits_for(&self, charge: u16) -> u16 {
        self.credit_request.max(charge).max(1)
    }
}
