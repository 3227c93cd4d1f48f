//! The request dispatcher: one incoming chat request in, one response or
//! event stream out.
//!
//! Three interacting state machines live here. The outer loop walks account
//! attempts (sticky selection, wait-or-rotate, exhaustion checks); the inner
//! loop walks the endpoint fallback list for one account; the classification
//! table at the bottom decides how each failure moves the outer loop. All
//! timing goes through the injected clock.

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::accounts::{Account, AccountManager, AccountSource};
use crate::auth::CredentialStore;
use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::error::{ApiError, AuthError, Error, Result};
use crate::format::anthropic::{MessagesRequest, MessagesResponse, StreamEvent};
use crate::format::google::parse_generate_response;
use crate::format::{build_response_from_events, convert_response};
use crate::models::{get_fallback_model, is_thinking_model};

use super::project::ProjectResolver;
use super::request::{build_envelope, build_headers};
use super::reset::parse_reset_time;
use super::sse::{SseParser, create_message_stop};
use super::ENDPOINTS;

/// Maximum time to wait for a single upstream frame before considering the
/// stream stalled (seconds).
const STREAM_FRAME_TIMEOUT_SECS: u64 = 300;

/// Channel buffer between the upstream reader and the consumer. Small: the
/// consumer's iteration rate is the intended backpressure.
const STREAM_CHANNEL_BUFFER: usize = 64;

/// Pause before trying the next endpoint / account after a server error.
const SERVER_ERROR_PAUSE: Duration = Duration::from_secs(1);

type HttpsClient = Client<
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    Full<Bytes>,
>;

/// A finite, non-restartable stream of public events.
///
/// The upstream HTTP body is owned by a background reader task; dropping the
/// stream aborts the task, which releases the connection at its next
/// suspension point.
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl EventStream {
    /// Next event, or `None` once the upstream closed and drained.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Result of a dispatch: buffered or streamed.
pub enum DispatchOutcome {
    Message(Box<MessagesResponse>),
    Stream(EventStream),
}

pub struct Dispatcher {
    accounts: Arc<AccountManager>,
    credentials: Arc<CredentialStore>,
    projects: Arc<ProjectResolver>,
    client: HttpsClient,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        accounts: Arc<AccountManager>,
        credentials: Arc<CredentialStore>,
        projects: Arc<ProjectResolver>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_only()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            accounts,
            credentials,
            projects,
            client,
            clock,
            config,
        }
    }

    /// Dispatch a request, optionally substituting the configured fallback
    /// model once when the primary model is exhausted on every account.
    ///
    /// The fallback is a single explicit hop, consumed on use; a second
    /// exhaustion surfaces as-is.
    pub async fn send(
        &self,
        request: &MessagesRequest,
        fallback_enabled: bool,
    ) -> Result<DispatchOutcome> {
        let result = self.dispatch(request).await;

        if fallback_enabled
            && let Err(error) = &result
            && is_model_exhaustion(error)
            && let Some(fallback_model) = get_fallback_model(&request.model)
        {
            warn!(
                primary = %request.model,
                fallback = %fallback_model,
                "Model exhausted on all accounts, retrying with fallback model"
            );
            let mut fallback_request = request.clone();
            fallback_request.model = fallback_model.to_string();
            return self.dispatch(&fallback_request).await;
        }

        result
    }

    /// One model, all accounts: the outer attempt loop.
    async fn dispatch(&self, request: &MessagesRequest) -> Result<DispatchOutcome> {
        let model = &request.model;
        let account_count = self.accounts.account_count().await;
        let max_attempts = (self.config.max_retries as usize).max(account_count + 1);

        for attempt in 0..max_attempts {
            let account = match self.select_account(model).await? {
                Some(account) => account,
                None => return Err(Error::Api(ApiError::NoAccountsAvailable)),
            };

            debug!(
                model = %model,
                account = %account.email,
                attempt = attempt + 1,
                max_attempts = max_attempts,
                "Dispatching request"
            );

            match self.attempt_account(&account, request).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => self.absorb_failure(&account, model, error, attempt).await?,
            }
        }

        Err(Error::Api(ApiError::MaxRetriesExceeded))
    }

    /// Steps 1–3 of the attempt: sticky pick, bounded wait, exhaustion check.
    async fn select_account(&self, model: &str) -> Result<Option<Account>> {
        let pick = self.accounts.pick_sticky(model).await;
        let mut account = pick.account;

        if account.is_none() && pick.wait_ms > 0 {
            info!(model = %model, wait_ms = pick.wait_ms, "Waiting out sticky account rate limit");
            self.clock.sleep(Duration::from_millis(pick.wait_ms)).await;
            self.accounts.clear_expired().await;
            account = self.accounts.current_sticky(model).await;
        }

        if account.is_none() && self.accounts.all_rate_limited(model).await {
            let min = self.accounts.min_wait(model).await;
            if min.wait_ms > self.config.max_wait_before_error_ms {
                let now = self.clock.now_ms();
                warn!(
                    model = %model,
                    wait_ms = min.wait_ms,
                    account = min.email.as_deref().unwrap_or("-"),
                    "All accounts rate limited beyond the wait cap"
                );
                return Err(Error::Api(ApiError::ResourceExhausted {
                    model: model.to_string(),
                    reset_at: now + min.wait_ms,
                    now,
                }));
            }

            info!(
                model = %model,
                wait_ms = min.wait_ms,
                account = min.email.as_deref().unwrap_or("-"),
                "All accounts rate limited, waiting for the earliest reset"
            );
            self.clock.sleep(Duration::from_millis(min.wait_ms)).await;
            self.accounts.clear_expired().await;
            account = self.accounts.pick_next(model).await;
        }

        Ok(account)
    }

    /// Steps 4–6: credentials, project, translation, endpoint loop.
    async fn attempt_account(
        &self,
        account: &Account,
        request: &MessagesRequest,
    ) -> Result<DispatchOutcome> {
        let token = self.credentials.token_for(account).await?;
        if account.source == AccountSource::Oauth {
            // The refresh worked, so a stale invalid flag is wrong
            self.accounts.clear_invalid(&account.email).await;
        }

        let project = self.projects.project_for(account, &token).await?;
        let envelope = build_envelope(request, &project);
        let body = Bytes::from(serde_json::to_vec(&envelope)?);

        // Thinking models only answer on the SSE path, even for buffered
        // callers; the JSON path 429s them.
        let streaming_caller = request.stream;
        let use_sse = streaming_caller || is_thinking_model(&request.model);

        self.try_endpoints(
            account,
            request,
            body,
            &token,
            use_sse,
            streaming_caller,
            &envelope.request_id,
        )
        .await
    }

    /// Step 5: walk the endpoint fallback list for one account.
    #[allow(clippy::too_many_arguments)]
    async fn try_endpoints(
        &self,
        account: &Account,
        request: &MessagesRequest,
        body: Bytes,
        token: &str,
        use_sse: bool,
        streaming_caller: bool,
        request_id: &str,
    ) -> Result<DispatchOutcome> {
        let model = &request.model;
        let headers = build_headers(token, model, use_sse);
        let path = if use_sse {
            "/v1internal:streamGenerateContent?alt=sse"
        } else {
            "/v1internal:generateContent"
        };

        let mut outcomes = EndpointOutcomes::new();

        for endpoint in ENDPOINTS {
            let url = format!("{endpoint}{path}");
            debug!(endpoint = %endpoint, model = %model, "Posting to Cloud Code endpoint");

            let response = match self.post(&url, &headers, body.clone()).await {
                Ok(response) => response,
                Err(message) => {
                    warn!(endpoint = %endpoint, error = %message, "Endpoint unreachable, trying next");
                    outcomes.record_failure(Error::Http(message));
                    continue;
                }
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                return self
                    .consume_success(response, request, streaming_caller, use_sse, request_id)
                    .await;
            }

            match status {
                401 => {
                    warn!(endpoint = %endpoint, account = %account.email, "Token rejected, clearing caches");
                    self.credentials.clear(Some(&account.email));
                    self.projects.clear(Some(&account.email));
                    outcomes.record_failure(Error::Auth(AuthError::TokenRejected));
                }
                429 => {
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let body_text = collect_body_text(response).await;
                    let reset_ms = parse_reset_time(
                        retry_after.as_deref(),
                        &body_text,
                        self.config.default_cooldown_ms,
                    );
                    info!(endpoint = %endpoint, model = %model, reset_ms = reset_ms, "Endpoint rate limited (429)");
                    outcomes.record_429(reset_ms);
                }
                500..=599 => {
                    warn!(endpoint = %endpoint, status = status, "Server error, pausing before next endpoint");
                    outcomes.record_failure(Error::Api(ApiError::Upstream5xx { status }));
                    self.clock.sleep(SERVER_ERROR_PAUSE).await;
                }
                _ => {
                    let body_text = collect_body_text(response).await;
                    let preview: String = body_text.chars().take(500).collect();
                    warn!(endpoint = %endpoint, status = status, body = %preview, "Client error from endpoint");
                    outcomes.record_failure(Error::Api(ApiError::Upstream4xx {
                        status,
                        body: preview,
                    }));
                }
            }
        }

        Err(outcomes.conclude(model))
    }

    /// Step 7: the per-account failure classification table.
    ///
    /// `Ok(())` continues the outer loop; `Err` fails the dispatch.
    async fn absorb_failure(
        &self,
        account: &Account,
        model: &str,
        error: Error,
        attempt: usize,
    ) -> Result<()> {
        match &error {
            Error::Api(ApiError::RateLimited { reset_ms, .. }) => {
                self.accounts
                    .mark_rate_limited(&account.email, Some(*reset_ms), model)
                    .await;
                warn!(
                    account = %account.email,
                    model = %model,
                    attempt = attempt + 1,
                    reset_ms = reset_ms,
                    "Account rate limited, moving on"
                );
                Ok(())
            }
            Error::Auth(AuthError::Invalid { email, reason }) => {
                self.accounts.mark_invalid(email, reason).await;
                Ok(())
            }
            Error::Auth(AuthError::TokenRejected)
            | Error::Auth(AuthError::MissingCredential { .. }) => {
                warn!(account = %account.email, attempt = attempt + 1, "Auth failure, trying next account");
                Ok(())
            }
            Error::Api(ApiError::Upstream5xx { status }) => {
                warn!(account = %account.email, status = status, "Server errors on all endpoints, rotating");
                self.accounts.pick_next(model).await;
                Ok(())
            }
            Error::Auth(AuthError::Network(_)) | Error::Http(_) => {
                warn!(account = %account.email, error = %error, "Network failure, pausing and rotating");
                self.clock.sleep(SERVER_ERROR_PAUSE).await;
                self.accounts.pick_next(model).await;
                Ok(())
            }
            _ => Err(error),
        }
    }

    /// A 2xx endpoint response, in one of the three consumption modes.
    async fn consume_success(
        &self,
        response: hyper::Response<Incoming>,
        request: &MessagesRequest,
        streaming_caller: bool,
        use_sse: bool,
        request_id: &str,
    ) -> Result<DispatchOutcome> {
        if streaming_caller {
            return Ok(DispatchOutcome::Stream(spawn_event_stream(
                &request.model,
                response,
            )));
        }

        if use_sse {
            // Thinking model, buffered caller: drain the stream and fold it
            let events = drain_sse(&request.model, response).await;
            if let Some(StreamEvent::Error { error }) = events
                .iter()
                .find(|e| matches!(e, StreamEvent::Error { .. }))
            {
                return Err(Error::Http(error.message.clone()));
            }
            return Ok(DispatchOutcome::Message(Box::new(
                build_response_from_events(&events, &request.model, request_id),
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .to_bytes();
        let parsed = parse_generate_response(&body)
            .map_err(|e| Error::Http(format!("invalid response JSON: {e}")))?;

        // Errors can ride inside a 200 body
        if let Some(error) = &parsed.error {
            return Err(match error.code {
                401 => Error::Auth(AuthError::TokenRejected),
                429 => Error::Api(ApiError::RateLimited {
                    model: request.model.clone(),
                    reset_ms: parse_reset_time(None, &error.message, self.config.default_cooldown_ms),
                }),
                code @ 500..=599 => Error::Api(ApiError::Upstream5xx { status: code as u16 }),
                code => Error::Api(ApiError::Upstream4xx {
                    status: code as u16,
                    body: error.message.clone(),
                }),
            });
        }

        Ok(DispatchOutcome::Message(Box::new(convert_response(
            &parsed,
            &request.model,
            request_id,
        ))))
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(Cow<'static, str>, Cow<'static, str>)],
        body: Bytes,
    ) -> std::result::Result<hyper::Response<Incoming>, String> {
        let mut req = hyper::Request::builder().method("POST").uri(url);
        for (name, value) in headers {
            req = req.header(name.as_ref(), value.as_ref());
        }
        let req = req.body(Full::new(body)).map_err(|e| e.to_string())?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match tokio::time::timeout(timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("request timed out after {}s", timeout.as_secs())),
        }
    }
}

/// Accumulated verdicts of one pass over the endpoint list.
///
/// Every endpoint answering 429 means the account is out of quota for the
/// model; the shortest advertised reset is kept (earliest-retry policy).
/// Anything else re-raises the last recorded failure.
struct EndpointOutcomes {
    tried: usize,
    count_429: usize,
    min_reset_ms: Option<u64>,
    last_failure: Option<Error>,
}

impl EndpointOutcomes {
    fn new() -> Self {
        Self {
            tried: 0,
            count_429: 0,
            min_reset_ms: None,
            last_failure: None,
        }
    }

    fn record_429(&mut self, reset_ms: u64) {
        self.tried += 1;
        self.count_429 += 1;
        self.min_reset_ms = Some(self.min_reset_ms.map_or(reset_ms, |m| m.min(reset_ms)));
    }

    fn record_failure(&mut self, error: Error) {
        self.tried += 1;
        self.last_failure = Some(error);
    }

    fn conclude(self, model: &str) -> Error {
        if self.tried > 0 && self.count_429 == self.tried {
            return Error::Api(ApiError::RateLimited {
                model: model.to_string(),
                reset_ms: self.min_reset_ms.unwrap_or(crate::accounts::DEFAULT_COOLDOWN_MS),
            });
        }
        self.last_failure
            .unwrap_or_else(|| Error::Http("all endpoints failed".to_string()))
    }
}

fn is_model_exhaustion(error: &Error) -> bool {
    matches!(
        error,
        Error::Api(ApiError::ResourceExhausted { .. }) | Error::Api(ApiError::NoAccountsAvailable)
    )
}

/// Spawn the reader task that owns the upstream body and feeds the stream.
fn spawn_event_stream(model: &str, upstream: hyper::Response<Incoming>) -> EventStream {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_BUFFER);
    let model = model.to_string();

    let task = tokio::spawn(async move {
        let mut parser = SseParser::new(&model);
        let mut incoming = upstream.into_body();
        let frame_timeout = Duration::from_secs(STREAM_FRAME_TIMEOUT_SECS);

        loop {
            match tokio::time::timeout(frame_timeout, incoming.frame()).await {
                Ok(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        let chunk = String::from_utf8_lossy(&data);
                        for event in parser.feed(&chunk) {
                            if tx.send(event).await.is_err() {
                                // Consumer cancelled
                                return;
                            }
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(model = %model, error = %e, "Error reading upstream stream");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(model = %model, "Upstream frame timeout");
                    break;
                }
            }
        }

        for event in parser.finish() {
            if tx.send(event).await.is_err() {
                return;
            }
        }
        let _ = tx.send(create_message_stop()).await;
    });

    EventStream { rx, task }
}

/// Read an SSE body to completion and return the full event list.
async fn drain_sse(model: &str, upstream: hyper::Response<Incoming>) -> Vec<StreamEvent> {
    let mut parser = SseParser::new(model);
    let mut events = Vec::new();
    let mut incoming = upstream.into_body();
    let frame_timeout = Duration::from_secs(STREAM_FRAME_TIMEOUT_SECS);

    loop {
        match tokio::time::timeout(frame_timeout, incoming.frame()).await {
            Ok(Some(Ok(frame))) => {
                if let Ok(data) = frame.into_data() {
                    events.extend(parser.feed(&String::from_utf8_lossy(&data)));
                }
            }
            Ok(Some(Err(e))) => {
                warn!(model = %model, error = %e, "Error reading upstream stream");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(model = %model, "Upstream frame timeout");
                break;
            }
        }
    }

    events.extend(parser.finish());
    events
}

async fn collect_body_text(response: hyper::Response<Incoming>) -> String {
    response
        .into_body()
        .collect()
        .await
        .map(|b| String::from_utf8_lossy(&b.to_bytes()).to_string())
        .unwrap_or_default()
}
