pub mod token;

pub use token::CredentialStore;

use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

/// Shared HTTPS client for auxiliary calls (token refresh, project
/// discovery). The dispatcher's model traffic uses its own client.
pub struct HttpClient {
    client: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
}

impl HttpClient {
    pub fn new() -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_only()
            .enable_http1()
            .build();

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }

    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, String> {
        let req = Request::builder()
            .method("POST")
            .uri(url)
            .header("Content-Type", content_type)
            .body(Full::new(Bytes::from(body.to_vec())))
            .map_err(|e| e.to_string())?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map(|b| String::from_utf8_lossy(&b.to_bytes()).to_string())
                .unwrap_or_default();
            return Err(format!("HTTP {}: {}", status, body));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| e.to_string())?;
        Ok(body.to_bytes().to_vec())
    }

    pub async fn post_with_auth(
        &self,
        url: &str,
        token: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, String> {
        let req = Request::builder()
            .method("POST")
            .uri(url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Content-Type", content_type)
            .header("User-Agent", crate::cloudcode::request::user_agent())
            .header(
                "X-Goog-Api-Client",
                "google-cloud-sdk vscode_cloudshelleditor/0.1",
            )
            .header("Client-Metadata", crate::cloudcode::request::CLIENT_METADATA)
            .body(Full::new(Bytes::from(body.to_vec())))
            .map_err(|e| e.to_string())?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| e.to_string())?;
        Ok(body.to_bytes().to_vec())
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}
