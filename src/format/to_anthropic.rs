//! Gemini → Anthropic response conversion.

use crate::format::anthropic::{
    ContentBlock, ContentDelta, MessagesResponse, Role, StopReason, StreamEvent, Usage,
};
use crate::format::google::{Candidate, GenerateContentResponse, Part, UsageMetadata};
use crate::format::signature_cache::{
    MIN_SIGNATURE_LENGTH, ModelFamily, cache_thinking_signature, cache_tool_signature,
};
use crate::models::get_model_family;

/// Convert a buffered `generateContent` response to a Messages response.
pub fn convert_response(
    response: &GenerateContentResponse,
    model: &str,
    request_id: &str,
) -> MessagesResponse {
    let model_family =
        ModelFamily::from_str(get_model_family(model)).unwrap_or(ModelFamily::Claude);

    let (content, stop_reason) = match response.candidates.as_ref().and_then(|c| c.first()) {
        Some(candidate) => convert_candidate(candidate, model_family),
        None => (vec![], None),
    };

    let usage = response
        .usage_metadata
        .as_ref()
        .map(convert_usage)
        .unwrap_or_default();

    MessagesResponse {
        id: request_id.to_string(),
        response_type: "message".to_string(),
        role: Role::Assistant,
        content,
        model: model.to_string(),
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

fn convert_candidate(
    candidate: &Candidate,
    model_family: ModelFamily,
) -> (Vec<ContentBlock>, Option<StopReason>) {
    let content = candidate
        .content
        .as_ref()
        .map(|c| {
            c.parts
                .iter()
                .filter_map(|p| convert_part(p, model_family))
                .collect()
        })
        .unwrap_or_default();

    let stop_reason = candidate
        .finish_reason
        .as_deref()
        .map(convert_finish_reason);

    (content, stop_reason)
}

fn convert_part(part: &Part, model_family: ModelFamily) -> Option<ContentBlock> {
    match part {
        Part::Text(text_part) => Some(ContentBlock::Text {
            text: text_part.text.clone(),
            cache_control: None,
        }),
        Part::FunctionCall(fc) => {
            let id = fc
                .function_call
                .id
                .clone()
                .unwrap_or_else(|| format!("toolu_{}", fallback_id()));

            if let Some(sig) = &fc.thought_signature
                && sig.len() >= MIN_SIGNATURE_LENGTH
            {
                cache_tool_signature(&id, sig);
            }

            Some(ContentBlock::ToolUse {
                id,
                name: fc.function_call.name.clone(),
                input: fc.function_call.args.clone(),
            })
        }
        Part::Thought(thought) => {
            let signature = thought.thought_signature.clone();

            if let Some(ref sig) = signature
                && sig.len() >= MIN_SIGNATURE_LENGTH
            {
                cache_thinking_signature(sig, model_family);
            }

            Some(ContentBlock::Thinking {
                thinking: thought.text.clone(),
                signature,
            })
        }
        Part::InlineData(_) | Part::FunctionResponse(_) => None,
    }
}

fn convert_finish_reason(reason: &str) -> StopReason {
    match reason {
        "MAX_TOKENS" => StopReason::MaxTokens,
        "STOP_SEQUENCE" => StopReason::StopSequence,
        "TOOL_CALL" | "FUNCTION_CALL" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

fn convert_usage(usage: &UsageMetadata) -> Usage {
    // Anthropic reports cached input separately from fresh input
    let input_tokens = usage
        .prompt_token_count
        .saturating_sub(usage.cached_content_token_count);

    Usage {
        input_tokens,
        output_tokens: usage.candidates_token_count,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: if usage.cached_content_token_count > 0 {
            Some(usage.cached_content_token_count)
        } else {
            None
        },
    }
}

fn fallback_id() -> String {
    let mut bytes = [0u8; 12];
    let _ = getrandom::fill(&mut bytes);
    let mut hex = String::with_capacity(24);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(hex, "{:02x}", b);
    }
    hex
}

/// Accumulate a transcoded event sequence into one Messages response.
///
/// Thinking models only speak the streaming endpoint; non-streaming callers
/// get the whole event stream folded into a single response here.
pub fn build_response_from_events(
    events: &[StreamEvent],
    model: &str,
    request_id: &str,
) -> MessagesResponse {
    let mut content: Vec<ContentBlock> = Vec::new();
    let mut stop_reason: Option<StopReason> = None;
    let mut usage = Usage::default();

    let mut current_text = String::new();
    let mut current_thinking = String::new();
    let mut current_signature = String::new();
    let mut in_text_block = false;
    let mut in_thinking_block = false;

    let mut flush =
        |content: &mut Vec<ContentBlock>,
         current_text: &mut String,
         current_thinking: &mut String,
         current_signature: &mut String,
         in_text_block: &mut bool,
         in_thinking_block: &mut bool| {
            if *in_text_block && !current_text.is_empty() {
                content.push(ContentBlock::Text {
                    text: std::mem::take(current_text),
                    cache_control: None,
                });
            }
            *in_text_block = false;
            if *in_thinking_block && !current_thinking.is_empty() {
                let signature = if current_signature.is_empty() {
                    None
                } else {
                    Some(std::mem::take(current_signature))
                };
                content.push(ContentBlock::Thinking {
                    thinking: std::mem::take(current_thinking),
                    signature,
                });
            }
            *in_thinking_block = false;
        };

    for event in events {
        match event {
            StreamEvent::MessageStart { message } => {
                usage = message.usage.clone();
            }
            StreamEvent::ContentBlockStart { content_block, .. } => match content_block {
                ContentBlock::Text { .. } => {
                    in_text_block = true;
                    current_text.clear();
                }
                ContentBlock::Thinking { signature, .. } => {
                    in_thinking_block = true;
                    current_thinking.clear();
                    current_signature = signature.clone().unwrap_or_default();
                }
                ContentBlock::ToolUse { id, name, input } => {
                    content.push(ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                }
                _ => {}
            },
            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                ContentDelta::Text { text } => {
                    if in_text_block {
                        current_text.push_str(text);
                    }
                }
                ContentDelta::Thinking { thinking } => {
                    if in_thinking_block {
                        current_thinking.push_str(thinking);
                    }
                }
                ContentDelta::InputJson { partial_json } => {
                    if let Some(ContentBlock::ToolUse { input, .. }) = content.last_mut()
                        && let Ok(parsed) = serde_json::from_str(partial_json)
                    {
                        *input = parsed;
                    }
                }
                ContentDelta::Signature { signature } => {
                    if in_thinking_block {
                        current_signature = signature.clone();
                    }
                }
            },
            StreamEvent::ContentBlockStop { .. } => {
                flush(
                    &mut content,
                    &mut current_text,
                    &mut current_thinking,
                    &mut current_signature,
                    &mut in_text_block,
                    &mut in_thinking_block,
                );
            }
            StreamEvent::MessageDelta {
                delta,
                usage: delta_usage,
            } => {
                if delta.stop_reason.is_some() {
                    stop_reason = delta.stop_reason;
                }
                usage.output_tokens = delta_usage.output_tokens;
            }
            _ => {}
        }
    }

    // A truncated stream may end mid-block
    flush(
        &mut content,
        &mut current_text,
        &mut current_thinking,
        &mut current_signature,
        &mut in_text_block,
        &mut in_thinking_block,
    );

    MessagesResponse {
        id: request_id.to_string(),
        response_type: "message".to_string(),
        role: Role::Assistant,
        content,
        model: model.to_string(),
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::anthropic::{MessageDeltaData, MessageDeltaUsage, MessageStart};
    use crate::format::google::{Content, TextPart, ThoughtPart};

    fn text_response(text: &str, finish_reason: Option<&str>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: Some(vec![Candidate {
                content: Some(Content {
                    role: "model".to_string(),
                    parts: vec![Part::Text(TextPart {
                        text: text.to_string(),
                    })],
                }),
                finish_reason: finish_reason.map(String::from),
            }]),
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: 100,
                candidates_token_count: 50,
                total_token_count: 150,
                cached_content_token_count: 0,
            }),
            error: None,
            prompt_feedback: None,
        }
    }

    #[test]
    fn test_convert_simple_response() {
        let response = text_response("Hello, world!", Some("STOP"));
        let result = convert_response(&response, "claude-sonnet-4-5", "req_123");

        assert_eq!(result.id, "req_123");
        assert_eq!(result.role, Role::Assistant);
        assert_eq!(result.stop_reason, Some(StopReason::EndTurn));
        match &result.content[0] {
            ContentBlock::Text { text, .. } => assert_eq!(text, "Hello, world!"),
            _ => panic!("Expected Text block"),
        }
    }

    #[test]
    fn test_convert_finish_reasons() {
        assert_eq!(convert_finish_reason("STOP"), StopReason::EndTurn);
        assert_eq!(convert_finish_reason("MAX_TOKENS"), StopReason::MaxTokens);
        assert_eq!(convert_finish_reason("TOOL_CALL"), StopReason::ToolUse);
        assert_eq!(convert_finish_reason("SOMETHING_ELSE"), StopReason::EndTurn);
    }

    #[test]
    fn test_convert_usage_with_cache_read() {
        let mut response = text_response("Hi", Some("STOP"));
        response.usage_metadata = Some(UsageMetadata {
            prompt_token_count: 1000,
            candidates_token_count: 100,
            total_token_count: 1100,
            cached_content_token_count: 800,
        });

        let result = convert_response(&response, "claude-sonnet-4-5", "req_cache");
        assert_eq!(result.usage.input_tokens, 200);
        assert_eq!(result.usage.output_tokens, 100);
        assert_eq!(result.usage.cache_read_input_tokens, Some(800));
    }

    #[test]
    fn test_convert_thought_part() {
        let response = GenerateContentResponse {
            candidates: Some(vec![Candidate {
                content: Some(Content {
                    role: "model".to_string(),
                    parts: vec![Part::Thought(ThoughtPart {
                        thought: true,
                        text: "let me think".to_string(),
                        thought_signature: None,
                    })],
                }),
                finish_reason: Some("STOP".to_string()),
            }]),
            usage_metadata: None,
            error: None,
            prompt_feedback: None,
        };

        let result = convert_response(&response, "claude-opus-4-5-thinking", "req_t");
        match &result.content[0] {
            ContentBlock::Thinking { thinking, .. } => assert_eq!(thinking, "let me think"),
            _ => panic!("Expected Thinking block"),
        }
    }

    #[test]
    fn test_convert_empty_response() {
        let response = GenerateContentResponse {
            candidates: None,
            usage_metadata: None,
            error: None,
            prompt_feedback: None,
        };
        let result = convert_response(&response, "claude-sonnet-4-5", "req_empty");
        assert!(result.content.is_empty());
        assert_eq!(result.stop_reason, None);
    }

    #[test]
    fn test_build_response_from_events() {
        let events = vec![
            StreamEvent::MessageStart {
                message: Box::new(MessageStart {
                    id: "msg_123".to_string(),
                    message_type: "message".to_string(),
                    role: Role::Assistant,
                    content: vec![],
                    model: "claude-opus-4-5-thinking".to_string(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage {
                        input_tokens: 100,
                        output_tokens: 0,
                        cache_read_input_tokens: None,
                        cache_creation_input_tokens: None,
                    },
                }),
            },
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
            },
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::Thinking {
                    thinking: "hmm".to_string(),
                },
            },
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::Signature {
                    signature: "sig_abc".to_string(),
                },
            },
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::ContentBlockStart {
                index: 1,
                content_block: ContentBlock::Text {
                    text: String::new(),
                    cache_control: None,
                },
            },
            StreamEvent::ContentBlockDelta {
                index: 1,
                delta: ContentDelta::Text {
                    text: "Hello ".to_string(),
                },
            },
            StreamEvent::ContentBlockDelta {
                index: 1,
                delta: ContentDelta::Text {
                    text: "world!".to_string(),
                },
            },
            StreamEvent::ContentBlockStop { index: 1 },
            StreamEvent::MessageDelta {
                delta: MessageDeltaData {
                    stop_reason: Some(StopReason::EndTurn),
                    stop_sequence: None,
                },
                usage: MessageDeltaUsage { output_tokens: 10 },
            },
        ];

        let result =
            build_response_from_events(&events, "claude-opus-4-5-thinking", "req_stream");

        assert_eq!(result.content.len(), 2);
        match &result.content[0] {
            ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                assert_eq!(thinking, "hmm");
                assert_eq!(signature.as_deref(), Some("sig_abc"));
            }
            _ => panic!("Expected Thinking block first"),
        }
        match &result.content[1] {
            ContentBlock::Text { text, .. } => assert_eq!(text, "Hello world!"),
            _ => panic!("Expected Text block second"),
        }
        assert_eq!(result.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(result.usage.input_tokens, 100);
        assert_eq!(result.usage.output_tokens, 10);
    }

    #[test]
    fn test_build_response_tool_use_input_json() {
        let events = vec![
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "get_weather".to_string(),
                    input: serde_json::json!({}),
                },
            },
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::InputJson {
                    partial_json: r#"{"location":"NYC"}"#.to_string(),
                },
            },
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageDelta {
                delta: MessageDeltaData {
                    stop_reason: Some(StopReason::ToolUse),
                    stop_sequence: None,
                },
                usage: MessageDeltaUsage { output_tokens: 4 },
            },
        ];

        let result = build_response_from_events(&events, "gemini-3-flash", "req_tool");
        match &result.content[0] {
            ContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "get_weather");
                assert_eq!(input["location"], "NYC");
            }
            _ => panic!("Expected ToolUse block"),
        }
        assert_eq!(result.stop_reason, Some(StopReason::ToolUse));
    }
}
