//! Project-id resolution via `:loadCodeAssist`, with a per-account cache.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::accounts::Account;
use crate::auth::HttpClient;
use crate::error::{AuthError, Error, Result};

use super::ENDPOINTS;

#[derive(Debug, Serialize)]
struct LoadCodeAssistRequest {
    metadata: LoadCodeAssistMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadCodeAssistMetadata {
    ide_type: &'static str,
    platform: &'static str,
    plugin_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duet_project: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadCodeAssistResponse {
    #[serde(default)]
    cloudaicompanion_project: Option<CloudAiProject>,
}

/// The project comes back either as a bare string or as `{id: ...}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CloudAiProject {
    String(String),
    Object { id: String },
}

impl CloudAiProject {
    fn id(&self) -> &str {
        match self {
            CloudAiProject::String(s) => s,
            CloudAiProject::Object { id } => id,
        }
    }
}

/// Caches project ids by account email; entries live until explicitly
/// cleared (a 401 clears them alongside the token cache).
pub struct ProjectResolver {
    http: Arc<HttpClient>,
    cache: Mutex<HashMap<String, String>>,
    default_project_id: Option<String>,
}

impl ProjectResolver {
    pub fn new(http: Arc<HttpClient>, default_project_id: Option<String>) -> Self {
        Self {
            http,
            cache: Mutex::new(HashMap::new()),
            default_project_id,
        }
    }

    /// Project id for the account: cache, explicit override, backend
    /// discovery across the endpoint list, then the configured default.
    pub async fn project_for(&self, account: &Account, token: &str) -> Result<String> {
        if let Some(cached) = self.cache.lock().get(&account.email).cloned() {
            return Ok(cached);
        }

        if let Some(project_id) = &account.project_id {
            self.cache
                .lock()
                .insert(account.email.clone(), project_id.clone());
            return Ok(project_id.clone());
        }

        match self.discover(account, token).await {
            Ok(project_id) => {
                self.cache
                    .lock()
                    .insert(account.email.clone(), project_id.clone());
                Ok(project_id)
            }
            Err(discovery_error) => match &self.default_project_id {
                Some(default) => {
                    warn!(
                        account = %account.email,
                        error = %discovery_error,
                        project_id = %default,
                        "Project discovery failed, using configured default"
                    );
                    self.cache
                        .lock()
                        .insert(account.email.clone(), default.clone());
                    Ok(default.clone())
                }
                None => Err(discovery_error),
            },
        }
    }

    async fn discover(&self, account: &Account, token: &str) -> Result<String> {
        let request_body = LoadCodeAssistRequest {
            metadata: LoadCodeAssistMetadata {
                ide_type: "IDE_UNSPECIFIED",
                platform: "PLATFORM_UNSPECIFIED",
                plugin_type: "GEMINI",
                duet_project: None,
            },
        };
        let body_bytes = serde_json::to_vec(&request_body)?;

        let mut last_error: Option<String> = None;

        for endpoint in ENDPOINTS {
            let url = format!("{}/v1internal:loadCodeAssist", endpoint);
            debug!(endpoint = %endpoint, account = %account.email, "Calling loadCodeAssist");

            match self
                .http
                .post_with_auth(&url, token, "application/json", &body_bytes)
                .await
            {
                Ok(response_bytes) => {
                    if let Ok(data) =
                        serde_json::from_slice::<LoadCodeAssistResponse>(&response_bytes)
                        && let Some(project) = data.cloudaicompanion_project
                    {
                        let project_id = project.id().to_string();
                        debug!(account = %account.email, project_id = %project_id, "Discovered project");
                        return Ok(project_id);
                    }
                    last_error = Some("no project in loadCodeAssist response".to_string());
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "loadCodeAssist request failed");
                    last_error = Some(e);
                }
            }
        }

        Err(Error::Auth(AuthError::ProjectDiscovery(
            last_error.unwrap_or_else(|| "unknown error".to_string()),
        )))
    }

    /// Drop one cached entry, or all of them.
    pub fn clear(&self, email: Option<&str>) {
        let mut cache = self.cache.lock();
        match email {
            Some(email) => {
                cache.remove(email);
            }
            None => cache.clear(),
        }
    }

    #[cfg(test)]
    fn prime(&self, email: &str, project_id: &str) {
        self.cache
            .lock()
            .insert(email.to_string(), project_id.to_string());
    }
}
