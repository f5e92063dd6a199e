/*
    capability.rs - Capability vocabulary and UCAN-style tokens

    Tokens are compact JWTs: base64url(header).base64url(claims).base64url(sig)
    where the signature covers "header.claims" and is produced by the
    issuer's Ed25519 key. Unsigned tokens (alg "none") are issued when
    running without an identity and carry an empty signature segment.
*/

use super::did::Did;
use super::errors::{CryptoError, CryptoResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const UCAN_VERSION: &str = "0.10.0";

/// Fixed capability vocabulary gating authenticated operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "aeon:sync:read")]
    SyncRead,
    #[serde(rename = "aeon:sync:write")]
    SyncWrite,
    #[serde(rename = "aeon:sync:admin")]
    SyncAdmin,
    #[serde(rename = "aeon:node:register")]
    NodeRegister,
    #[serde(rename = "aeon:node:heartbeat")]
    NodeHeartbeat,
    #[serde(rename = "aeon:replicate:read")]
    ReplicateRead,
    #[serde(rename = "aeon:replicate:write")]
    ReplicateWrite,
    #[serde(rename = "aeon:state:read")]
    StateRead,
    #[serde(rename = "aeon:state:write")]
    StateWrite,
    #[serde(rename = "aeon:state:reconcile")]
    StateReconcile,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::SyncRead,
        Capability::SyncWrite,
        Capability::SyncAdmin,
        Capability::NodeRegister,
        Capability::NodeHeartbeat,
        Capability::ReplicateRead,
        Capability::ReplicateWrite,
        Capability::StateRead,
        Capability::StateWrite,
        Capability::StateReconcile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::SyncRead => "aeon:sync:read",
            Capability::SyncWrite => "aeon:sync:write",
            Capability::SyncAdmin => "aeon:sync:admin",
            Capability::NodeRegister => "aeon:node:register",
            Capability::NodeHeartbeat => "aeon:node:heartbeat",
            Capability::ReplicateRead => "aeon:replicate:read",
            Capability::ReplicateWrite => "aeon:replicate:write",
            Capability::StateRead => "aeon:state:read",
            Capability::StateWrite => "aeon:state:write",
            Capability::StateReconcile => "aeon:state:reconcile",
        }
    }

    /// Whether holding `self` is enough to exercise `required`
    ///
    /// `aeon:sync:admin` implies the read and write sync scopes.
    pub fn grants(&self, required: Capability) -> bool {
        *self == required
            || (*self == Capability::SyncAdmin
                && matches!(required, Capability::SyncRead | Capability::SyncWrite))
    }

    /// Default scope minted for a sync session
    pub fn session_scope() -> Vec<Capability> {
        vec![Capability::SyncRead, Capability::SyncWrite]
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CryptoError::InvalidToken(format!("unknown capability '{}'", s)))
    }
}

/// Whether `held` covers every capability in `required`
pub fn covers(held: &[Capability], required: &[Capability]) -> Result<(), Capability> {
    match required.iter().find(|r| !held.iter().any(|h| h.grants(**r))) {
        Some(missing) => Err(*missing),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UcanHeader {
    pub alg: String,
    pub typ: String,
    pub ucv: String,
}

/// Claims carried by a capability token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UcanClaims {
    pub iss: Did,
    pub aud: Did,
    pub att: Vec<Capability>,
    /// Expiry, unix seconds
    pub exp: i64,
    /// Not-before, unix seconds
    pub nbf: i64,
    pub nnc: String,
}

impl UcanClaims {
    pub fn is_expired_at(&self, now_secs: i64) -> bool {
        now_secs >= self.exp
    }

    pub fn is_active_at(&self, now_secs: i64) -> bool {
        now_secs >= self.nbf && !self.is_expired_at(now_secs)
    }
}

/// A token split into its three segments
#[derive(Debug, Clone)]
pub struct ParsedUcan {
    pub header: UcanHeader,
    pub claims: UcanClaims,
    /// "header.claims", the signed input
    pub signing_input: String,
    pub signature: Vec<u8>,
}

pub fn encode_signing_input(header: &UcanHeader, claims: &UcanClaims) -> CryptoResult<String> {
    let header = serde_json::to_vec(header).map_err(|e| CryptoError::InvalidToken(e.to_string()))?;
    let claims = serde_json::to_vec(claims).map_err(|e| CryptoError::InvalidToken(e.to_string()))?;
    Ok(format!("{}.{}", URL_SAFE_NO_PAD.encode(header), URL_SAFE_NO_PAD.encode(claims)))
}

pub fn assemble_token(signing_input: &str, signature: &[u8]) -> String {
    format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature))
}

pub fn parse_token(token: &str) -> CryptoResult<ParsedUcan> {
    let mut parts = token.split('.');
    let (Some(header), Some(claims), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CryptoError::InvalidToken("expected three segments".to_string()));
    };

    let decode = |segment: &str| {
        URL_SAFE_NO_PAD.decode(segment).map_err(|e| CryptoError::InvalidToken(e.to_string()))
    };

    let parsed_header: UcanHeader = serde_json::from_slice(&decode(header)?)
        .map_err(|e| CryptoError::InvalidToken(format!("header: {}", e)))?;
    let parsed_claims: UcanClaims = serde_json::from_slice(&decode(claims)?)
        .map_err(|e| CryptoError::InvalidToken(format!("claims: {}", e)))?;

    Ok(ParsedUcan {
        header: parsed_header,
        claims: parsed_claims,
        signing_input: format!("{}.{}", header, claims),
        signature: decode(signature)?,
    })
}
