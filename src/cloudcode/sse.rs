//! Incremental transcoding of the backend's SSE stream into the public
//! Anthropic event sequence.
//!
//! The parser buffers at most one event boundary; each complete upstream
//! event is translated and handed back immediately, so backpressure is the
//! consumer's iteration rate.

use crate::format::google::{CloudCodeEnvelopeResponse, GenerateContentResponse, Part};
use crate::format::{
    ContentBlock, ContentDelta, ErrorData, MIN_SIGNATURE_LENGTH, MessageDeltaData,
    MessageDeltaUsage, MessageStart, ModelFamily, Role, StopReason, StreamEvent, Usage,
    cache_thinking_signature, cache_tool_signature,
};
use crate::models::get_model_family;

pub struct SseParser {
    buffer: String,
    model: String,
    message_id: String,
    has_emitted_start: bool,
    block_index: u32,
    current_block_type: Option<BlockType>,
    current_thinking_signature: String,
    input_tokens: u32,
    output_tokens: u32,
    cache_read_tokens: u32,
    stop_reason: Option<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum BlockType {
    Text,
    Thinking,
    ToolUse,
}

impl SseParser {
    pub fn new(model: &str) -> Self {
        Self {
            buffer: String::with_capacity(4096),
            model: model.to_string(),
            message_id: format!("msg_{}", random_hex(16)),
            has_emitted_start: false,
            block_index: 0,
            current_block_type: None,
            current_thinking_signature: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            stop_reason: None,
        }
    }

    /// Feed a raw chunk; returns every event completed by it.
    pub fn feed(&mut self, data: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(data);

        let mut events = Vec::new();

        // Event boundary is a blank line, CRLF or LF flavoured
        loop {
            let boundary = self
                .buffer
                .find("\r\n\r\n")
                .map(|p| (p, 4))
                .or_else(|| self.buffer.find("\n\n").map(|p| (p, 2)));

            match boundary {
                Some((pos, skip)) => {
                    let line = self.buffer[..pos].to_string();
                    self.buffer.drain(..pos + skip);

                    if let Some(parsed) = self.parse_line(&line) {
                        events.extend(parsed);
                    }
                }
                None => break,
            }
        }

        events
    }

    fn parse_line(&mut self, line: &str) -> Option<Vec<StreamEvent>> {
        let data = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))?
            .trim();

        if data == "[DONE]" {
            return Some(vec![create_message_stop()]);
        }

        let response = match serde_json::from_str::<CloudCodeEnvelopeResponse>(data) {
            Ok(envelope) => envelope.response,
            Err(parse_err) => {
                // Before falling back to a bare parse, inspect the raw JSON.
                // A wrapper with unexpected structure (e.g. a version-gate
                // notice whose content has no role) would otherwise parse to
                // all-None fields; surface whatever text it carries instead.
                if let Ok(raw) = serde_json::from_str::<serde_json::Value>(data) {
                    if raw.get("response").is_some() {
                        let message = raw
                            .pointer("/response/candidates/0/content/parts/0/text")
                            .and_then(|v| v.as_str())
                            .map(String::from)
                            .unwrap_or_else(|| {
                                format!("unparseable upstream event: {parse_err}")
                            });
                        tracing::warn!(model = %self.model, message = %message, "Unparseable SSE wrapper");
                        return Some(vec![error_event("api_error", message)]);
                    }
                    if let Some(error_obj) = raw.get("error") {
                        let status = error_obj
                            .get("status")
                            .and_then(|s| s.as_str())
                            .unwrap_or("UNKNOWN");
                        let message = error_obj
                            .get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("Unknown error");
                        tracing::warn!(model = %self.model, status = %status, message = %message, "Backend error in SSE stream");
                        return Some(vec![error_event(
                            "api_error",
                            format!("Backend error ({}): {}", status, message),
                        )]);
                    }
                }

                // Plain (unwrapped) generateContent event
                match serde_json::from_str::<GenerateContentResponse>(data) {
                    Ok(response) => response,
                    Err(_) => {
                        tracing::debug!(
                            data = %data.chars().take(200).collect::<String>(),
                            "Skipping unparseable SSE data"
                        );
                        return None;
                    }
                }
            }
        };

        if let Some(error) = &response.error {
            tracing::warn!(
                model = %self.model,
                code = error.code,
                status = %error.status,
                message = %error.message,
                "Backend error in generateContent response"
            );
            return Some(vec![error_event(
                "api_error",
                format!("Backend error ({}): {}", error.status, error.message),
            )]);
        }

        Some(self.process_response(&response))
    }

    fn process_response(&mut self, response: &GenerateContentResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(usage) = &response.usage_metadata {
            self.input_tokens = usage.prompt_token_count;
            self.output_tokens = usage.candidates_token_count;
            self.cache_read_tokens = usage.cached_content_token_count;
        }

        let first_candidate = response.candidates.as_ref().and_then(|c| c.first());

        if let Some(feedback) = &response.prompt_feedback
            && let Some(reason) = &feedback.block_reason
        {
            tracing::warn!(model = %self.model, block_reason = %reason, "Prompt blocked upstream");
            return vec![error_event(
                "invalid_request_error",
                format!("Prompt blocked upstream (reason: {})", reason),
            )];
        }

        if let Some(candidate) = first_candidate
            && let Some(reason) = &candidate.finish_reason
        {
            let upper = reason.to_uppercase();
            if matches!(upper.as_str(), "SAFETY" | "BLOCKED" | "RECITATION" | "OTHER") {
                tracing::warn!(model = %self.model, finish_reason = %reason, "Response blocked upstream");
                return vec![error_event(
                    "api_error",
                    format!("Response blocked upstream (reason: {})", reason),
                )];
            }
        }

        if first_candidate.is_none() && !self.has_emitted_start {
            tracing::warn!(model = %self.model, "Upstream event carried no candidates");
            return vec![error_event(
                "api_error",
                format!(
                    "Model {} returned no candidates. The model may be unavailable.",
                    self.model
                ),
            )];
        }

        let parts = first_candidate
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or(&[]);

        if !self.has_emitted_start && !parts.is_empty() {
            self.has_emitted_start = true;
            let adjusted_input = self.input_tokens.saturating_sub(self.cache_read_tokens);
            events.push(StreamEvent::MessageStart {
                message: Box::new(MessageStart {
                    id: self.message_id.clone(),
                    message_type: "message".to_string(),
                    role: Role::Assistant,
                    content: vec![],
                    model: self.model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage {
                        input_tokens: adjusted_input,
                        output_tokens: 0,
                        cache_read_input_tokens: (self.cache_read_tokens > 0)
                            .then_some(self.cache_read_tokens),
                        cache_creation_input_tokens: Some(0),
                    },
                }),
            });
        }

        for part in parts {
            match part {
                Part::Thought(thought) => {
                    if self.current_block_type != Some(BlockType::Thinking) {
                        if let Some(prev) = self.current_block_type {
                            events.extend(self.close_block(prev));
                        }
                        self.current_block_type = Some(BlockType::Thinking);
                        self.current_thinking_signature.clear();

                        events.push(StreamEvent::ContentBlockStart {
                            index: self.block_index,
                            content_block: ContentBlock::Thinking {
                                thinking: String::new(),
                                signature: None,
                            },
                        });
                    }

                    let signature = thought.thought_signature.as_deref().unwrap_or("");
                    if signature.len() >= MIN_SIGNATURE_LENGTH {
                        self.current_thinking_signature = signature.to_string();
                        let family = ModelFamily::from_str(get_model_family(&self.model))
                            .unwrap_or(ModelFamily::Claude);
                        cache_thinking_signature(signature, family);
                    }

                    if !thought.text.is_empty() {
                        events.push(StreamEvent::ContentBlockDelta {
                            index: self.block_index,
                            delta: ContentDelta::Thinking {
                                thinking: thought.text.clone(),
                            },
                        });
                    }
                }

                Part::Text(text_part) => {
                    if text_part.text.is_empty() {
                        continue;
                    }

                    if self.current_block_type != Some(BlockType::Text) {
                        events.extend(self.flush_thinking_signature());
                        if let Some(prev) = self.current_block_type {
                            events.extend(self.close_block(prev));
                        }
                        self.current_block_type = Some(BlockType::Text);

                        events.push(StreamEvent::ContentBlockStart {
                            index: self.block_index,
                            content_block: ContentBlock::Text {
                                text: String::new(),
                                cache_control: None,
                            },
                        });
                    }

                    events.push(StreamEvent::ContentBlockDelta {
                        index: self.block_index,
                        delta: ContentDelta::Text {
                            text: text_part.text.clone(),
                        },
                    });
                }

                Part::FunctionCall(fc) => {
                    events.extend(self.flush_thinking_signature());
                    if let Some(prev) = self.current_block_type {
                        events.extend(self.close_block(prev));
                    }
                    self.current_block_type = Some(BlockType::ToolUse);
                    self.stop_reason = Some("tool_use".to_string());

                    let tool_id = fc
                        .function_call
                        .id
                        .clone()
                        .or_else(|| {
                            fc.function_call
                                .args
                                .get("id")
                                .and_then(|v| v.as_str())
                                .map(String::from)
                        })
                        .unwrap_or_else(|| format!("toolu_{}", random_hex(12)));

                    events.push(StreamEvent::ContentBlockStart {
                        index: self.block_index,
                        content_block: ContentBlock::ToolUse {
                            id: tool_id.clone(),
                            name: fc.function_call.name.clone(),
                            input: serde_json::Value::Object(serde_json::Map::new()),
                        },
                    });

                    // The "id" key is routing metadata, not a tool parameter
                    let args = if let serde_json::Value::Object(mut obj) =
                        fc.function_call.args.clone()
                    {
                        obj.remove("id");
                        serde_json::Value::Object(obj)
                    } else {
                        fc.function_call.args.clone()
                    };
                    events.push(StreamEvent::ContentBlockDelta {
                        index: self.block_index,
                        delta: ContentDelta::InputJson {
                            partial_json: serde_json::to_string(&args).unwrap_or_default(),
                        },
                    });

                    let signature = fc.thought_signature.as_deref().unwrap_or("");
                    if signature.len() >= MIN_SIGNATURE_LENGTH {
                        cache_tool_signature(&tool_id, signature);
                    }
                }

                _ => {}
            }
        }

        if let Some(candidate) = first_candidate
            && let Some(finish_reason) = &candidate.finish_reason
            && self.stop_reason.is_none()
        {
            self.stop_reason = Some(match finish_reason.as_str() {
                "MAX_TOKENS" => "max_tokens".to_string(),
                _ => "end_turn".to_string(),
            });
        }

        events
    }

    /// A thinking block carries its signature as a trailing delta.
    fn flush_thinking_signature(&mut self) -> Vec<StreamEvent> {
        if self.current_block_type == Some(BlockType::Thinking)
            && !self.current_thinking_signature.is_empty()
        {
            let signature = std::mem::take(&mut self.current_thinking_signature);
            vec![StreamEvent::ContentBlockDelta {
                index: self.block_index,
                delta: ContentDelta::Signature { signature },
            }]
        } else {
            Vec::new()
        }
    }

    fn close_block(&mut self, _block_type: BlockType) -> Vec<StreamEvent> {
        let events = vec![StreamEvent::ContentBlockStop {
            index: self.block_index,
        }];
        self.block_index += 1;
        events
    }

    /// Upstream closed; emit the trailing block close and message_delta.
    pub fn finish(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(_block_type) = self.current_block_type {
            events.extend(self.flush_thinking_signature());
            events.push(StreamEvent::ContentBlockStop {
                index: self.block_index,
            });
        }

        let stop_reason = match self.stop_reason.as_deref() {
            Some("max_tokens") => StopReason::MaxTokens,
            Some("tool_use") => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        };
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaData {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: MessageDeltaUsage {
                output_tokens: self.output_tokens,
            },
        });

        events
    }
}

fn error_event(error_type: &str, message: String) -> StreamEvent {
    StreamEvent::Error {
        error: ErrorData {
            error_type: error_type.to_string(),
            message,
        },
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    let _ = getrandom::fill(&mut buf);
    let mut hex = String::with_capacity(bytes * 2);
    for b in buf {
        use std::fmt::Write;
        let _ = write!(hex, "{:02x}", b);
    }
    hex
}

pub fn create_message_stop() -> StreamEvent {
    StreamEvent::MessageStop
}

/// Render an event in SSE wire form: `event: <type>\ndata: <json>\n\n`.
pub fn format_sse_event(event: &StreamEvent) -> String {
    let event_type = match event {
        StreamEvent::MessageStart { .. } => "message_start",
        StreamEvent::ContentBlockStart { .. } => "content_block_start",
        StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
        StreamEvent::ContentBlockStop { .. } => "content_block_stop",
        StreamEvent::MessageDelta { .. } => "message_delta",
        StreamEvent::MessageStop => "message_stop",
        StreamEvent::Ping => "ping",
        StreamEvent::Error { .. } => "error",
    };

    let data = serde_json::to_string(event).unwrap_or_default();
    format!("event: {}\ndata: {}\n\n", event_type, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_text_stream() {
        let mut parser = SseParser::new("claude-sonnet-4-5");

        let data = "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hello, world!\"}]}}],\"usageMetadata\":{\"promptTokenCount\":10,\"candidatesTokenCount\":5,\"cachedContentTokenCount\":0}}}\n\n";
        let events = parser.feed(data);

        match &events[0] {
            StreamEvent::MessageStart { message } => {
                assert_eq!(message.model, "claude-sonnet-4-5");
                assert!(message.id.starts_with("msg_"));
                assert_eq!(message.usage.input_tokens, 10);
            }
            other => panic!("Expected MessageStart, got {:?}", other),
        }
        assert!(matches!(
            events[1],
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::Text { .. }
            }
        ));
        match &events[2] {
            StreamEvent::ContentBlockDelta {
                delta: ContentDelta::Text { text },
                ..
            } => assert_eq!(text, "Hello, world!"),
            other => panic!("Expected text delta, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_chunks_buffer() {
        let mut parser = SseParser::new("gemini-3-flash");

        // Nothing completes until the blank-line boundary arrives
        let events = parser.feed("data: {\"response\":{\"candidates\":[{\"content\":");
        assert!(events.is_empty());

        let events = parser
            .feed("{\"role\":\"model\",\"parts\":[{\"text\":\"hi\"}]}}]}}\n\n");
        assert!(!events.is_empty());
    }

    #[test]
    fn test_done_signal() {
        let mut parser = SseParser::new("claude-sonnet-4-5");
        let events = parser.feed("data: [DONE]\n\n");

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::MessageStop));
    }

    #[test]
    fn test_crlf_boundaries() {
        let mut parser = SseParser::new("claude-sonnet-4-5");
        let events = parser.feed("data: [DONE]\r\n\r\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_thinking_then_text_emits_signature() {
        let mut parser = SseParser::new("claude-opus-4-5-thinking");
        let signature = "s".repeat(60);

        let thinking = format!(
            "data: {{\"response\":{{\"candidates\":[{{\"content\":{{\"role\":\"model\",\"parts\":[{{\"thought\":true,\"text\":\"pondering\",\"thoughtSignature\":\"{signature}\"}}]}}}}]}}}}\n\n"
        );
        let events = parser.feed(&thinking);
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ContentBlockStart {
                content_block: ContentBlock::Thinking { .. },
                ..
            }
        )));

        let text = "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"answer\"}]}}]}}\n\n";
        let events = parser.feed(text);

        // Switching away from thinking emits the signature, closes the
        // block, and opens a text block at the next index
        let signature_pos = events.iter().position(|e| {
            matches!(e, StreamEvent::ContentBlockDelta { delta: ContentDelta::Signature { signature: s }, .. } if *s == signature)
        });
        let stop_pos = events
            .iter()
            .position(|e| matches!(e, StreamEvent::ContentBlockStop { index: 0 }));
        let text_start_pos = events.iter().position(|e| {
            matches!(
                e,
                StreamEvent::ContentBlockStart {
                    index: 1,
                    content_block: ContentBlock::Text { .. }
                }
            )
        });

        assert!(signature_pos.unwrap() < stop_pos.unwrap());
        assert!(stop_pos.unwrap() < text_start_pos.unwrap());
    }

    #[test]
    fn test_short_signature_not_emitted() {
        let mut parser = SseParser::new("claude-opus-4-5-thinking");

        let thinking = "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"thought\":true,\"text\":\"t\",\"thoughtSignature\":\"short\"}]}}]}}\n\n";
        parser.feed(thinking);

        let events = parser.finish();
        assert!(!events.iter().any(|e| matches!(
            e,
            StreamEvent::ContentBlockDelta {
                delta: ContentDelta::Signature { .. },
                ..
            }
        )));
    }

    #[test]
    fn test_function_call_stream() {
        let mut parser = SseParser::new("gemini-3-flash");

        let data = "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"functionCall\":{\"name\":\"get_weather\",\"args\":{\"location\":\"NYC\"}}}]}}]}}\n\n";
        let events = parser.feed(data);

        let start = events.iter().find_map(|e| match e {
            StreamEvent::ContentBlockStart {
                content_block: ContentBlock::ToolUse { id, name, .. },
                ..
            } => Some((id.clone(), name.clone())),
            _ => None,
        });
        let (id, name) = start.expect("tool_use start event");
        assert!(id.starts_with("toolu_"));
        assert_eq!(name, "get_weather");

        let input_json = events.iter().find_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                delta: ContentDelta::InputJson { partial_json },
                ..
            } => Some(partial_json.clone()),
            _ => None,
        });
        assert_eq!(input_json.unwrap(), r#"{"location":"NYC"}"#);

        // finish() reports tool_use as the stop reason
        let events = parser.finish();
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::MessageDelta {
                delta: MessageDeltaData {
                    stop_reason: Some(StopReason::ToolUse),
                    ..
                },
                ..
            }
        )));
    }

    #[test]
    fn test_finish_reports_usage() {
        let mut parser = SseParser::new("claude-sonnet-4-5");
        let data = "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hi\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":10,\"candidatesTokenCount\":2,\"cachedContentTokenCount\":0}}}\n\n";
        parser.feed(data);

        let events = parser.finish();
        match events.last().unwrap() {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(StopReason::EndTurn));
                assert_eq!(usage.output_tokens, 2);
            }
            other => panic!("Expected MessageDelta, got {:?}", other),
        }
    }

    #[test]
    fn test_top_level_error_event() {
        let mut parser = SseParser::new("claude-opus-4-5-thinking");
        let data = "data: {\"error\":{\"code\":404,\"message\":\"Requested entity was not found.\",\"status\":\"NOT_FOUND\"}}\n\n";
        let events = parser.feed(data);

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error { error } => {
                assert_eq!(error.error_type, "api_error");
                assert!(error.message.contains("NOT_FOUND"));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_wrapped_error_event() {
        let mut parser = SseParser::new("claude-opus-4-5-thinking");
        let data = "data: {\"response\":{\"candidates\":null,\"error\":{\"code\":503,\"message\":\"capacity exhausted\",\"status\":\"UNAVAILABLE\"}}}\n\n";
        let events = parser.feed(data);

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error { error } => {
                assert!(error.message.contains("UNAVAILABLE"));
                assert!(error.message.contains("capacity exhausted"));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_version_gate_text_surfaced() {
        // The version gate response has content with no role, which fails
        // envelope parsing; its text must still reach the caller.
        let mut parser = SseParser::new("claude-opus-4-6-thinking");
        let data = "data: {\"response\": {\"candidates\": [{\"content\": {\"parts\": [{\"text\": \"This version is no longer supported.\"}]}}]}}\n\n";
        let events = parser.feed(data);

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error { error } => {
                assert!(error.message.contains("no longer supported"));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_format_sse_event() {
        let formatted = format_sse_event(&StreamEvent::MessageStop);
        assert!(formatted.starts_with("event: message_stop\n"));
        assert!(formatted.contains("data: "));
        assert!(formatted.ends_with("\n\n"));
    }
}
