//! Access-token acquisition: OAuth refresh exchange plus a TTL cache keyed
//! by account email. Manual api-key and legacy state-file sources share the
//! same cache so every caller goes through one path.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::accounts::{Account, AccountSource};
use crate::clock::Clock;
use crate::error::{AuthError, Error, Result};

use super::HttpClient;

// These OAuth client credentials are **intentionally public**. This is
// Google's "installed application" (native/CLI) flow, where the client
// secret cannot be kept confidential:
// https://developers.google.com/identity/protocols/oauth2/native-app
// A valid refresh token is still required for any access.
pub const CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
pub const CLIENT_SECRET: &str = "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";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Message fragments that mark a refresh failure as transport-level rather
/// than a rejection of the credential itself.
const NETWORK_ERROR_PATTERNS: &[&str] = &[
    "connection",
    "connect error",
    "timed out",
    "timeout",
    "dns",
    "unreachable",
    "network",
    "reset by peer",
    "broken pipe",
];

/// A refresh failure that looks like transport trouble must not invalidate
/// the account: the credential may be perfectly fine.
pub fn is_network_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    NETWORK_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

pub async fn refresh_access_token(
    http_client: &HttpClient,
    refresh_token: &str,
) -> std::result::Result<String, String> {
    // Composite format carried over from the JS proxy:
    // refreshToken|projectId|managedProjectId
    let actual_refresh_token = refresh_token.split('|').next().unwrap_or(refresh_token);

    let body = format!(
        "client_id={}&client_secret={}&refresh_token={}&grant_type=refresh_token",
        CLIENT_ID, CLIENT_SECRET, actual_refresh_token
    );

    let response = http_client
        .post(
            TOKEN_URL,
            "application/x-www-form-urlencoded",
            body.as_bytes(),
        )
        .await?;

    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
    }

    let tokens: TokenResponse =
        serde_json::from_slice(&response).map_err(|e| format!("invalid token response: {e}"))?;

    Ok(tokens.access_token)
}

struct TokenEntry {
    token: String,
    extracted_at_ms: u64,
}

/// Per-account access tokens with a freshness TTL.
pub struct CredentialStore {
    http: Arc<HttpClient>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    tokens: Mutex<HashMap<String, TokenEntry>>,
}

impl CredentialStore {
    pub fn new(http: Arc<HttpClient>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            http,
            clock,
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Obtain an access token for the account, re-exchanging only when the
    /// cached one has aged out or was explicitly cleared.
    ///
    /// Returns `AuthError::Network` for transient refresh failures and
    /// `AuthError::Invalid` for rejected credentials; the caller decides
    /// whether to flag the account.
    pub async fn token_for(&self, account: &Account) -> Result<String> {
        if let Some(token) = self.cached_token(&account.email) {
            return Ok(token);
        }

        let token = match account.source {
            AccountSource::Oauth => {
                let refresh_token = account.refresh_token.as_deref().ok_or_else(|| {
                    Error::Auth(AuthError::MissingCredential {
                        email: account.email.clone(),
                    })
                })?;

                match refresh_access_token(&self.http, refresh_token).await {
                    Ok(token) => token,
                    Err(message) if is_network_error(&message) => {
                        tracing::warn!(
                            account = %account.email,
                            error = %message,
                            "Token refresh hit a network error, not invalidating"
                        );
                        return Err(Error::Auth(AuthError::Network(message)));
                    }
                    Err(message) => {
                        return Err(Error::Auth(AuthError::Invalid {
                            email: account.email.clone(),
                            reason: message,
                        }));
                    }
                }
            }
            AccountSource::Manual => account.api_key.clone().ok_or_else(|| {
                Error::Auth(AuthError::MissingCredential {
                    email: account.email.clone(),
                })
            })?,
            AccountSource::LegacyDb => {
                let path = account.db_path.clone().ok_or_else(|| {
                    Error::Auth(AuthError::MissingCredential {
                        email: account.email.clone(),
                    })
                })?;
                read_legacy_token(&path).await.map_err(|reason| {
                    Error::Auth(AuthError::Invalid {
                        email: account.email.clone(),
                        reason,
                    })
                })?
            }
        };

        self.store_token(&account.email, token.clone());
        Ok(token)
    }

    /// Fresh cached token for an email, if any.
    pub fn cached_token(&self, email: &str) -> Option<String> {
        let tokens = self.tokens.lock();
        let entry = tokens.get(email)?;
        let age = self.clock.now_ms().saturating_sub(entry.extracted_at_ms);
        (age < self.ttl.as_millis() as u64).then(|| entry.token.clone())
    }

    pub fn store_token(&self, email: &str, token: String) {
        self.tokens.lock().insert(
            email.to_string(),
            TokenEntry {
                token,
                extracted_at_ms: self.clock.now_ms(),
            },
        );
    }

    /// Drop one cached token, or all of them.
    pub fn clear(&self, email: Option<&str>) {
        let mut tokens = self.tokens.lock();
        match email {
            Some(email) => {
                tokens.remove(email);
            }
            None => tokens.clear(),
        }
    }
}

/// Pull an access token out of a local Antigravity state file.
async fn read_legacy_token(path: &std::path::Path) -> std::result::Result<String, String> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| format!("invalid state file: {e}"))?;

    value
        .get("access_token")
        .or_else(|| value.pointer("/tokens/access_token"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| format!("no access_token in {}", path.display()))
}
