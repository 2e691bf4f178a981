use http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use tracing::warn;

pub const IDENTITY_PREFIX_API_KEY: &str = "api_key";
pub const IDENTITY_PREFIX_USER: &str = "user";
pub const IDENTITY_PREFIX_IP: &str = "ip";

/// Number of hex characters of the API key digest kept in the identity.
const IDENTITY_HASH_LENGTH: usize = 16;

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

/// Derives a stable client identity from request metadata.
///
/// Extraction is deterministic and total: API key, then bearer-token claim,
/// then source address, so every request yields exactly one identity and the
/// same request always maps to the same identity across retries.
pub struct IdentityExtractor {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl IdentityExtractor {
    pub fn new(jwt_secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Extract the client identity for a request. Never fails.
    pub fn extract(&self, headers: &HeaderMap, peer_addr: Option<SocketAddr>) -> String {
        if let Some(api_key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            if !api_key.is_empty() {
                return format!("{}:{}", IDENTITY_PREFIX_API_KEY, hash_api_key(api_key));
            }
        }

        if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                match decode::<Claims>(token, &self.decoding_key, &self.validation) {
                    Ok(data) => {
                        if let Some(user_id) = data.claims.user_id.or(data.claims.sub) {
                            return format!("{}:{}", IDENTITY_PREFIX_USER, user_id);
                        }
                    }
                    Err(e) => {
                        warn!("invalid bearer token, falling back to source address: {}", e);
                    }
                }
            }
        }

        format!("{}:{}", IDENTITY_PREFIX_IP, client_ip(headers, peer_addr))
    }
}

/// Hash an API key so raw keys never reach the store or logs
fn hash_api_key(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    digest
        .iter()
        .take(IDENTITY_HASH_LENGTH / 2)
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Source address, preferring proxy-forwarded headers over the peer socket
fn client_ip(headers: &HeaderMap, peer_addr: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first_hop) = forwarded.split(',').next() {
            let first_hop = first_hop.trim();
            if !first_hop.is_empty() {
                return first_hop.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    match peer_addr {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}
