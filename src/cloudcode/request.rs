//! Outbound payload construction: the wrapped Cloud Code envelope, the
//! deterministic session id, and the platform header set.

use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::format::anthropic::{ContentBlock, MessageContent, MessagesRequest, Role};
use crate::format::convert_request;
use crate::format::google::CloudCodeEnvelope;
use crate::models::{get_model_family, is_thinking_model};

/// Version the upstream service expects in the user agent.
pub const UPSTREAM_VERSION: &str = "1.15.8";

pub const CLIENT_METADATA: &str =
    r#"{"ideType":"IDE_UNSPECIFIED","platform":"PLATFORM_UNSPECIFIED","pluginType":"GEMINI"}"#;

static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "antigravity/{} {}/{}",
        UPSTREAM_VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

pub fn user_agent() -> &'static str {
    &USER_AGENT
}

pub fn build_headers(
    access_token: &str,
    model: &str,
    streaming: bool,
) -> Vec<(Cow<'static, str>, Cow<'static, str>)> {
    let mut headers = Vec::with_capacity(7);
    headers.push((
        Cow::Borrowed("Authorization"),
        Cow::Owned(format!("Bearer {}", access_token)),
    ));
    headers.push((
        Cow::Borrowed("Content-Type"),
        Cow::Borrowed("application/json"),
    ));
    headers.push((Cow::Borrowed("User-Agent"), Cow::Owned(USER_AGENT.clone())));
    headers.push((
        Cow::Borrowed("X-Goog-Api-Client"),
        Cow::Borrowed("google-cloud-sdk vscode_cloudshelleditor/0.1"),
    ));
    headers.push((Cow::Borrowed("Client-Metadata"), Cow::Borrowed(CLIENT_METADATA)));

    if get_model_family(model) == "claude" && is_thinking_model(model) {
        headers.push((
            Cow::Borrowed("anthropic-beta"),
            Cow::Borrowed("interleaved-thinking-2025-05-14"),
        ));
    }

    if streaming {
        headers.push((Cow::Borrowed("Accept"), Cow::Borrowed("text/event-stream")));
    }

    headers
}

/// Wrap a translated request in the Cloud Code envelope.
pub fn build_envelope(anthropic_request: &MessagesRequest, project_id: &str) -> CloudCodeEnvelope {
    let mut google_request = convert_request(anthropic_request);
    google_request.session_id = Some(derive_session_id(anthropic_request));

    CloudCodeEnvelope {
        project: project_id.to_string(),
        model: anthropic_request.model.clone(),
        request: google_request,
        user_agent: "antigravity".to_string(),
        request_id: format!("agent-{}", Uuid::new_v4()),
    }
}

/// Stable session id: hash of the first user message so that retries and
/// continuations of one conversation land on the same backend session.
fn derive_session_id(request: &MessagesRequest) -> String {
    let first_user_content = request
        .messages
        .iter()
        .find(|m| matches!(m.role, Role::User))
        .map(|m| match &m.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        })
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(first_user_content.as_bytes());
    let hash = hasher.finalize();
    // 16 bytes of hash = 32 hex chars is plenty of identity
    let mut hex = String::with_capacity(32);
    for &b in &hash[..16] {
        use std::fmt::Write;
        let _ = write!(hex, "{:02x}", b);
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::anthropic::Message;

    fn request_with_text(model: &str, text: &str) -> MessagesRequest {
        MessagesRequest {
            model: model.to_string(),
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text(text.to_string()),
            }],
            max_tokens: 512,
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
    fn test_headers_basic() {
        let headers = build_headers("tok_1", "claude-sonnet-4-5", false);
        let find = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_ref().to_string())
        };

        assert_eq!(find("Authorization"), Some("Bearer tok_1".to_string()));
        assert_eq!(find("Content-Type"), Some("application/json".to_string()));
        assert!(find("User-Agent").unwrap().starts_with("antigravity/"));
        // Non-thinking, non-streaming: no beta header, no SSE accept
        assert!(find("anthropic-beta").is_none());
        assert!(find("Accept").is_none());
    }

    #[test]
    fn test_headers_claude_thinking_beta() {
        let headers = build_headers("tok", "claude-opus-4-6-thinking", false);
        assert!(headers.iter().any(|(n, v)| {
            n == "anthropic-beta" && v == "interleaved-thinking-2025-05-14"
        }));

        // Gemini thinking models do not get the Anthropic beta header
        let headers = build_headers("tok", "gemini-3-pro-high", false);
        assert!(!headers.iter().any(|(n, _)| n == "anthropic-beta"));
    }

    #[test]
    fn test_headers_streaming_accept() {
        let headers = build_headers("tok", "gemini-3-flash", true);
        assert!(headers
            .iter()
            .any(|(n, v)| n == "Accept" && v == "text/event-stream"));
    }

    #[test]
    fn test_envelope_shape() {
        let request = request_with_text("gemini-3-flash", "hello");
        let envelope = build_envelope(&request, "project-1");

        assert_eq!(envelope.project, "project-1");
        assert_eq!(envelope.model, "gemini-3-flash");
        assert_eq!(envelope.user_agent, "antigravity");
        assert!(envelope.request_id.starts_with("agent-"));
        assert_eq!(envelope.request_id.len(), "agent-".len() + 36);
        assert!(envelope.request.session_id.is_some());
    }

    #[test]
    fn test_session_id_deterministic() {
        let a = build_envelope(&request_with_text("m", "same prompt"), "p");
        let b = build_envelope(&request_with_text("m", "same prompt"), "p");
        let c = build_envelope(&request_with_text("m", "other prompt"), "p");

        assert_eq!(a.request.session_id, b.request.session_id);
        assert_ne!(a.request.session_id, c.request.session_id);
        assert_eq!(a.request.session_id.as_ref().unwrap().len(), 32);
    }

    #[test]
    fn test_session_id_from_first_user_message() {
        let mut request = request_with_text("m", "first");
        request.messages.push(Message {
            role: Role::Assistant,
            content: MessageContent::Text("reply".to_string()),
        });
        request.messages.push(Message {
            role: Role::User,
            content: MessageContent::Text("second".to_string()),
        });

        // A continuation keeps the session of the opening message
        let continued = build_envelope(&request, "p");
        let fresh = build_envelope(&request_with_text("m", "first"), "p");
        assert_eq!(continued.request.session_id, fresh.request.session_id);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let request = request_with_text("m", "hi");
        let a = build_envelope(&request, "p");
        let b = build_envelope(&request, "p");
        assert_ne!(a.request_id, b.request_id);
    }
}
