use http_body_util::{BodyExt, Either, Full};
use hyper::body::{Bytes, Frame};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::accounts::AccountManager;
use crate::cloudcode::{DispatchOutcome, Dispatcher, format_sse_event};
use crate::config::get_config;
use crate::error::{ApiError, Error};
use crate::format::{MessagesRequest, ModelInfo, ModelsResponse, StreamEvent};
use crate::models::{Model, resolve_model_alias};

/// Maximum request body size (10 MB).
const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

/// Channel buffer for outgoing SSE frames.
const STREAM_CHANNEL_BUFFER: usize = 64;

/// A streaming response body backed by an `mpsc` channel.
///
/// Each received `Bytes` value becomes one DATA frame; a dropped sender
/// signals end-of-stream.
pub struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl hyper::body::Body for ChannelBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

type ResponseBody = Either<Full<Bytes>, ChannelBody>;

fn full_body(bytes: Vec<u8>) -> ResponseBody {
    Either::Left(Full::new(Bytes::from(bytes)))
}

fn streaming_body() -> (mpsc::Sender<Bytes>, ResponseBody) {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_BUFFER);
    (tx, Either::Right(ChannelBody { rx }))
}

/// Shared server state passed to all request handlers.
pub struct ServerState {
    pub dispatcher: Dispatcher,
    pub accounts: Arc<AccountManager>,
}

/// Handle one TCP connection as HTTP/1.1.
pub async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let state = state.clone();
        async move { handle_request(req, state, remote_addr).await }
    });

    http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .await?;

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ServerState>,
    remote_addr: SocketAddr,
) -> Result<Response<ResponseBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    debug!(
        method = %method,
        path = %path,
        remote = %remote_addr,
        request_id = %request_id,
        "Received request"
    );

    let start = std::time::Instant::now();

    if method == Method::OPTIONS {
        return Ok(cors_preflight_response());
    }

    let config = get_config();
    if path.starts_with("/v1/")
        && let Some(ref expected_key) = config.server.api_key
    {
        let auth_header = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        let x_api_key = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());

        let provided_key = auth_header
            .and_then(|h| h.strip_prefix("Bearer "))
            .or(x_api_key);

        if provided_key != Some(expected_key.as_str()) {
            warn!(remote = %remote_addr, request_id = %request_id, "Rejected request with invalid API key");
            return Ok(json_response(
                StatusCode::UNAUTHORIZED,
                r#"{"type":"error","error":{"type":"authentication_error","message":"Invalid or missing API key"}}"#,
            ));
        }
    }

    let request_timeout = Duration::from_secs(config.server.request_timeout_secs);
    let response = match tokio::time::timeout(request_timeout, async {
        match (method.clone(), path.as_str()) {
            (Method::POST, "/v1/messages") | (Method::POST, "/messages") => {
                handle_messages(req, state, &request_id).await
            }

            (Method::GET, "/v1/models") => handle_models(),

            (Method::POST, "/accounts/reload") => handle_accounts_reload(&state).await,

            // Optimistic manual override: forget all rate-limit records
            (Method::POST, "/accounts/reset-limits") => {
                state.accounts.reset_all_limits().await;
                Ok(json_response(StatusCode::OK, r#"{"status":"reset"}"#))
            }

            (Method::GET, "/health") | (Method::GET, "/") => handle_health(&state).await,

            _ => Ok(json_response(
                StatusCode::NOT_FOUND,
                r#"{"type":"error","error":{"type":"not_found_error","message":"Not found"}}"#,
            )),
        }
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::Http(format!(
            "request timed out after {}s",
            request_timeout.as_secs()
        ))),
    };

    let duration = start.elapsed();

    match response {
        Ok(resp) => {
            info!(
                method = %method,
                path = %path,
                status = resp.status().as_u16(),
                duration_ms = duration.as_millis(),
                request_id = %request_id,
                "Request completed"
            );
            Ok(resp)
        }
        Err(e) => {
            let resp = error_to_response(&e, &request_id);
            warn!(
                method = %method,
                path = %path,
                status = resp.status().as_u16(),
                duration_ms = duration.as_millis(),
                request_id = %request_id,
                error = %e,
                "Request error"
            );
            Ok(resp)
        }
    }
}

fn generate_request_id() -> String {
    let mut bytes = [0u8; 8];
    let _ = getrandom::fill(&mut bytes);
    let mut id = String::with_capacity(20);
    id.push_str("req_");
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(id, "{:02x}", b);
    }
    id
}

async fn handle_messages(
    req: Request<hyper::body::Incoming>,
    state: Arc<ServerState>,
    request_id: &str,
) -> Result<Response<ResponseBody>, Error> {
    let content_type = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.contains("application/json") {
        return Err(Error::Api(ApiError::InvalidRequest {
            message: "Content-Type must be application/json".to_string(),
        }));
    }

    if let Some(len) = req.headers().get("content-length")
        && let Ok(len_str) = len.to_str()
        && let Ok(len) = len_str.parse::<usize>()
        && len > MAX_REQUEST_SIZE
    {
        return Err(Error::Api(ApiError::RequestTooLarge {
            size: len,
            max: MAX_REQUEST_SIZE,
        }));
    }

    let body_bytes = read_body_limited(req.into_body(), MAX_REQUEST_SIZE).await?;
    let mut messages_request: MessagesRequest = serde_json::from_slice(&body_bytes)?;

    let original_model = messages_request.model.clone();
    messages_request.model = resolve_model_alias(&messages_request.model).to_string();
    debug!(
        original_model = %original_model,
        resolved_model = %messages_request.model,
        request_id = %request_id,
        "Model resolution"
    );

    validate_request(&messages_request)?;

    let config = get_config();
    let result = state
        .dispatcher
        .send(&messages_request, config.accounts.fallback)
        .await;

    match result {
        Ok(DispatchOutcome::Message(response)) => {
            let body = serde_json::to_vec(&response)?;
            Ok(json_ok_response(body, request_id))
        }
        Ok(DispatchOutcome::Stream(mut stream)) => {
            let (tx, body) = streaming_body();
            let response = sse_response(body, request_id);

            // Forward transcoded events as they arrive; a closed channel
            // means the client went away, which drops (and so cancels)
            // the upstream event stream.
            tokio::spawn(async move {
                while let Some(event) = stream.next().await {
                    let formatted = format_sse_event(&event);
                    if tx.send(Bytes::from(formatted)).await.is_err() {
                        return;
                    }
                }
            });

            Ok(response)
        }
        Err(error) if messages_request.stream => {
            // Streaming callers get the failure as an SSE error event
            let event = StreamEvent::Error {
                error: crate::format::ErrorData {
                    error_type: error.wire_type().to_string(),
                    message: error.to_string(),
                },
            };
            let mut body = format_sse_event(&event);
            body.push_str(&format_sse_event(&StreamEvent::MessageStop));
            Ok(sse_buffered_response(body, request_id))
        }
        Err(error) => Err(error),
    }
}

fn handle_models() -> Result<Response<ResponseBody>, Error> {
    let models: Vec<ModelInfo> = Model::all()
        .iter()
        .map(|m| ModelInfo {
            id: m.anthropic_id().to_string(),
            model_type: "model".to_string(),
            display_name: m.anthropic_id().to_string(),
            created_at: "2025-01-01T00:00:00Z".to_string(),
        })
        .collect();

    let body = serde_json::to_vec(&ModelsResponse { data: models })?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(full_body(body))
        .unwrap())
}

async fn handle_health(state: &Arc<ServerState>) -> Result<Response<ResponseBody>, Error> {
    // Summarised against a representative model; per-model detail lives in
    // the store itself.
    let summary = state
        .accounts
        .summary(Model::ClaudeSonnet4_5.anthropic_id())
        .await;
    let body = serde_json::json!({
        "status": if summary.usable > 0 { "ok" } else { "degraded" },
        "accounts": summary,
    });
    Ok(json_response(StatusCode::OK, &body.to_string()))
}

async fn handle_accounts_reload(state: &Arc<ServerState>) -> Result<Response<ResponseBody>, Error> {
    let config = get_config();
    let store = crate::accounts::AccountStore::load(
        &config.accounts_path(),
        config.accounts.max_accounts,
    )?;
    let count = store.accounts.len();
    state.accounts.replace(store).await;

    info!(count = count, "Reloaded account store");
    Ok(json_response(
        StatusCode::OK,
        &format!(r#"{{"status":"reloaded","accounts":{}}}"#, count),
    ))
}

fn validate_request(request: &MessagesRequest) -> Result<(), Error> {
    if request.messages.is_empty() {
        return Err(Error::Api(ApiError::InvalidRequest {
            message: "messages must not be empty".to_string(),
        }));
    }
    if request.max_tokens == 0 {
        return Err(Error::Api(ApiError::InvalidRequest {
            message: "max_tokens must be positive".to_string(),
        }));
    }
    Ok(())
}

async fn read_body_limited(
    body: hyper::body::Incoming,
    limit: usize,
) -> Result<Bytes, Error> {
    let collected = body
        .collect()
        .await
        .map_err(|e| Error::Http(e.to_string()))?
        .to_bytes();
    if collected.len() > limit {
        return Err(Error::Api(ApiError::RequestTooLarge {
            size: collected.len(),
            max: limit,
        }));
    }
    Ok(collected)
}

fn json_response(status: StatusCode, body: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(full_body(body.as_bytes().to_vec()))
        .unwrap()
}

fn json_ok_response(body: Vec<u8>, request_id: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .header("X-Request-ID", request_id)
        .body(full_body(body))
        .unwrap()
}

fn sse_response(body: ResponseBody, request_id: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("Access-Control-Allow-Origin", "*")
        .header("X-Request-ID", request_id)
        .body(body)
        .unwrap()
}

fn sse_buffered_response(body: String, request_id: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Access-Control-Allow-Origin", "*")
        .header("X-Request-ID", request_id)
        .body(full_body(body.into_bytes()))
        .unwrap()
}

fn cors_preflight_response() -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header(
            "Access-Control-Allow-Headers",
            "Content-Type, Authorization, X-Api-Key, X-Request-ID, anthropic-version",
        )
        .body(full_body(Vec::new()))
        .unwrap()
}

/// Map an internal error to the Anthropic-shaped error object.
fn error_to_response(error: &Error, request_id: &str) -> Response<ResponseBody> {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "type": "error",
        "error": {
            "type": error.wire_type(),
            "message": error.to_string(),
        }
    });

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .header("X-Request-ID", request_id)
        .body(full_body(body.to_string().into_bytes()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use crate::format::anthropic::{Message, MessageContent, Role};

    fn request(model: &str) -> MessagesRequest {
        MessagesRequest {
            model: model.to_string(),
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text("hi".to_string()),
            }],
            max_tokens: 128,
            stream: false,
            system: None,
            tools: None,
            thinking: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
        }
    }

    #[test]
    fn test_validate_request() {
        assert!(validate_request(&request("m")).is_ok());

        let mut empty = request("m");
        empty.messages.clear();
        assert!(validate_request(&empty).is_err());

        let mut zero = request("m");
        zero.max_tokens = 0;
        assert!(validate_request(&zero).is_err());
    }

    #[test]
    fn test_error_to_response_shapes() {
        let resp = error_to_response(&Error::Api(ApiError::NoAccountsAvailable), "req_1");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = error_to_response(
            &Error::Auth(AuthError::Invalid {
                email: "a@x.com".to_string(),
                reason: "invalid_grant".to_string(),
            }),
            "req_2",
        );
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = error_to_response(
            &Error::Api(ApiError::ResourceExhausted {
                model: "m".to_string(),
                reset_at: 10_000,
                now: 0,
            }),
            "req_3",
        );
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_generate_request_id_format() {
        let id = generate_request_id();
        assert!(id.starts_with("req_"));
        assert_eq!(id.len(), 20);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_models_listing() {
        let resp = handle_models().unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
