//! Anthropic → Gemini request conversion.

use crate::format::anthropic::{
    ContentBlock, Message, MessageContent, MessagesRequest, Role, SystemPrompt, Tool,
    ToolResultContent,
};
use crate::format::google::{
    Content, FunctionCall, FunctionCallPart, FunctionDeclaration, FunctionResponse,
    FunctionResponsePart, GenerateContentRequest, GenerationConfig, GoogleTool, InlineData,
    InlineDataPart, Part, TextPart, ThinkingConfig, ThoughtPart,
};
use crate::format::signature_cache::{
    GEMINI_SKIP_SIGNATURE, MIN_SIGNATURE_LENGTH, ModelFamily, get_cached_tool_signature,
    is_signature_compatible,
};
use crate::models::{get_model_family, is_thinking_model};

const DEFAULT_THINKING_BUDGET: u32 = 16000;

pub fn convert_request(request: &MessagesRequest) -> GenerateContentRequest {
    let model_family = get_model_family(&request.model);
    let target_family = ModelFamily::from_str(model_family);

    let contents = request
        .messages
        .iter()
        .map(|m| convert_message(m, target_family))
        .collect();

    let system_instruction = request.system.as_ref().map(convert_system_prompt);

    let thinking_config = if is_thinking_model(&request.model) {
        match model_family {
            "claude" => Some(ThinkingConfig::Claude {
                include_thoughts: true,
            }),
            "gemini" => Some(ThinkingConfig::Gemini {
                include_thoughts: true,
                thinking_budget: request
                    .thinking
                    .as_ref()
                    .and_then(|t| t.budget_tokens)
                    .unwrap_or(DEFAULT_THINKING_BUDGET),
            }),
            _ => None,
        }
    } else {
        None
    };

    let generation_config = Some(GenerationConfig {
        max_output_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stop_sequences: request.stop_sequences.clone(),
        thinking_config,
    });

    let tools = request
        .tools
        .as_ref()
        .filter(|t| !t.is_empty())
        .map(|t| convert_tools(t));

    GenerateContentRequest {
        contents,
        system_instruction,
        generation_config,
        tools,
        session_id: None,
    }
}

fn convert_message(message: &Message, target_family: Option<ModelFamily>) -> Content {
    let role = match message.role {
        Role::User => "user".to_string(),
        Role::Assistant => "model".to_string(),
    };

    let parts = match &message.content {
        MessageContent::Text(text) => {
            vec![Part::Text(TextPart { text: text.clone() })]
        }
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| convert_content_block(b, target_family))
            .collect(),
    };

    Content { role, parts }
}

fn convert_content_block(block: &ContentBlock, target_family: Option<ModelFamily>) -> Option<Part> {
    match block {
        ContentBlock::Text { text, .. } => Some(Part::Text(TextPart { text: text.clone() })),
        ContentBlock::Image { source } => Some(Part::InlineData(InlineDataPart {
            inline_data: InlineData {
                mime_type: source.media_type.clone(),
                data: source.data.clone(),
            },
        })),
        ContentBlock::ToolUse { id, name, input } => {
            // Gemini insists on a thoughtSignature for replayed calls; restore
            // the cached one or fall back to the skip sentinel.
            let thought_signature = if target_family == Some(ModelFamily::Gemini) {
                Some(
                    get_cached_tool_signature(id)
                        .unwrap_or_else(|| GEMINI_SKIP_SIGNATURE.to_string()),
                )
            } else {
                None
            };

            Some(Part::FunctionCall(FunctionCallPart {
                function_call: FunctionCall {
                    name: name.clone(),
                    args: input.clone(),
                    id: Some(id.clone()),
                },
                thought_signature,
            }))
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let text = match content {
                ToolResultContent::Text(text) => text.clone(),
                ToolResultContent::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text, .. } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            let response = if is_error.unwrap_or(false) {
                serde_json::json!({ "error": text })
            } else {
                serde_json::json!({ "result": text })
            };

            Some(Part::FunctionResponse(FunctionResponsePart {
                function_response: FunctionResponse {
                    // The id must match the replayed functionCall id
                    name: tool_use_id.clone(),
                    response,
                    id: Some(tool_use_id.clone()),
                },
            }))
        }
        ContentBlock::Thinking {
            thinking,
            signature,
        } => {
            // A signature that crossed the family boundary would fail
            // upstream validation; drop the whole block so the turn succeeds.
            if let (Some(sig), Some(target)) = (signature.as_ref(), target_family)
                && !is_signature_compatible(sig, target)
            {
                return None;
            }

            let valid_signature = signature
                .as_ref()
                .filter(|s| s.len() >= MIN_SIGNATURE_LENGTH)
                .cloned();

            Some(Part::Thought(ThoughtPart {
                thought: true,
                text: thinking.clone(),
                thought_signature: valid_signature,
            }))
        }
    }
}

fn convert_system_prompt(system: &SystemPrompt) -> Content {
    let parts = match system {
        SystemPrompt::Text(text) => {
            vec![Part::Text(TextPart { text: text.clone() })]
        }
        SystemPrompt::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| convert_content_block(b, None))
            .collect(),
    };

    // The backend expects "user" role on system instructions
    Content {
        role: "user".to_string(),
        parts,
    }
}

fn convert_tools(tools: &[Tool]) -> Vec<GoogleTool> {
    let declarations = tools
        .iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: Some(sanitize_schema(&tool.input_schema)),
        })
        .collect();

    vec![GoogleTool {
        function_declarations: declarations,
    }]
}

// The Cloud Code API accepts only a subset of JSON Schema; everything else
// must be stripped or the whole request is rejected.
fn sanitize_schema(schema: &serde_json::Value) -> serde_json::Value {
    const ALLOWED_FIELDS: &[&str] = &["type", "description", "properties", "required", "items", "enum"];

    let obj = match schema {
        serde_json::Value::Object(obj) => obj,
        serde_json::Value::Array(arr) => {
            return serde_json::Value::Array(arr.iter().map(sanitize_schema).collect());
        }
        other => return other.clone(),
    };

    let mut clean = serde_json::Map::new();

    for (key, value) in obj {
        // "const" has no Cloud Code equivalent; a single-element enum does
        if key == "const" {
            clean.insert("enum".to_string(), serde_json::json!([value]));
            continue;
        }
        if !ALLOWED_FIELDS.contains(&key.as_str()) {
            continue;
        }

        match key.as_str() {
            "properties" => {
                if let serde_json::Value::Object(props) = value {
                    let sanitized: serde_json::Map<String, serde_json::Value> = props
                        .iter()
                        .map(|(k, v)| (k.clone(), sanitize_schema(v)))
                        .collect();
                    clean.insert(key.clone(), serde_json::Value::Object(sanitized));
                }
            }
            "items" => {
                clean.insert(key.clone(), sanitize_schema(value));
            }
            _ => {
                clean.insert(key.clone(), value.clone());
            }
        }
    }

    if !clean.contains_key("type") {
        clean.insert("type".to_string(), serde_json::json!("object"));
    }

    // Object schemas with no properties are rejected; give them a placeholder
    let empty_object = clean.get("type") == Some(&serde_json::json!("object"))
        && clean
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|o| o.is_empty())
            .unwrap_or(true);
    if empty_object {
        clean.insert(
            "properties".to_string(),
            serde_json::json!({
                "reason": {
                    "type": "string",
                    "description": "Reason for calling this tool"
                }
            }),
        );
        clean.insert("required".to_string(), serde_json::json!(["reason"]));
    }

    // `required` may only reference properties that survived sanitization
    if let (Some(serde_json::Value::Array(required)), Some(serde_json::Value::Object(props))) =
        (clean.get("required"), clean.get("properties"))
    {
        let valid: Vec<_> = required
            .iter()
            .filter(|r| r.as_str().map(|s| props.contains_key(s)).unwrap_or(false))
            .cloned()
            .collect();
        if valid.is_empty() {
            clean.remove("required");
        } else {
            clean.insert("required".to_string(), serde_json::Value::Array(valid));
        }
    }

    serde_json::Value::Object(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::anthropic::ThinkingParam;

    fn create_test_request(model: &str, content: &str) -> MessagesRequest {
        MessagesRequest {
            model: model.to_string(),
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text(content.to_string()),
            }],
            max_tokens: 1024,
            system: None,
            tools: None,
            thinking: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: false,
        }
    }

    #[test]
    fn test_convert_simple_request() {
        let request = create_test_request("claude-sonnet-4-5", "Hello");
        let google_req = convert_request(&request);

        assert_eq!(google_req.contents.len(), 1);
        assert_eq!(google_req.contents[0].role, "user");

        let gen_config = google_req.generation_config.unwrap();
        assert_eq!(gen_config.max_output_tokens, Some(1024));
        assert!(gen_config.thinking_config.is_none());
    }

    #[test]
    fn test_convert_claude_thinking_request() {
        let request = create_test_request("claude-opus-4-5-thinking", "Think about this");
        let google_req = convert_request(&request);

        match google_req.generation_config.unwrap().thinking_config {
            Some(ThinkingConfig::Claude { include_thoughts }) => assert!(include_thoughts),
            other => panic!("Expected Claude thinking config, got {:?}", other),
        }
    }

    #[test]
    fn test_convert_gemini_thinking_budget() {
        let mut request = create_test_request("gemini-3-flash", "Process this");
        let google_req = convert_request(&request);
        match google_req.generation_config.unwrap().thinking_config {
            Some(ThinkingConfig::Gemini {
                thinking_budget, ..
            }) => assert_eq!(thinking_budget, DEFAULT_THINKING_BUDGET),
            other => panic!("Expected Gemini thinking config, got {:?}", other),
        }

        // Explicit client budget wins
        request.thinking = Some(ThinkingParam {
            thinking_type: "enabled".to_string(),
            budget_tokens: Some(4000),
        });
        let google_req = convert_request(&request);
        match google_req.generation_config.unwrap().thinking_config {
            Some(ThinkingConfig::Gemini {
                thinking_budget, ..
            }) => assert_eq!(thinking_budget, 4000),
            other => panic!("Expected Gemini thinking config, got {:?}", other),
        }
    }

    #[test]
    fn test_convert_system_prompt() {
        let mut request = create_test_request("claude-sonnet-4-5", "Hello");
        request.system = Some(SystemPrompt::Text("You are helpful".to_string()));

        let google_req = convert_request(&request);
        let sys = google_req.system_instruction.unwrap();
        assert_eq!(sys.role, "user");
        assert_eq!(sys.parts.len(), 1);
    }

    #[test]
    fn test_convert_with_tools() {
        let mut request = create_test_request("claude-sonnet-4-5", "Use the tool");
        request.tools = Some(vec![Tool {
            name: "get_weather".to_string(),
            description: Some("Get weather for a location".to_string()),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "location": {"type": "string", "format": "city"}
                },
                "required": ["location"]
            }),
        }]);

        let google_req = convert_request(&request);
        let tools = google_req.tools.unwrap();
        assert_eq!(tools[0].function_declarations.len(), 1);

        // Unsupported "format" key is stripped, allowed keys survive
        let params = tools[0].function_declarations[0].parameters.as_ref().unwrap();
        let location = &params["properties"]["location"];
        assert_eq!(location["type"], "string");
        assert!(location.get("format").is_none());
    }

    #[test]
    fn test_sanitize_empty_object_schema() {
        let sanitized = sanitize_schema(&serde_json::json!({"type": "object"}));
        assert!(sanitized["properties"]["reason"].is_object());
        assert_eq!(sanitized["required"], serde_json::json!(["reason"]));
    }

    #[test]
    fn test_sanitize_const_becomes_enum() {
        let sanitized = sanitize_schema(&serde_json::json!({
            "type": "string",
            "const": "fixed"
        }));
        assert_eq!(sanitized["enum"], serde_json::json!(["fixed"]));
    }

    #[test]
    fn test_sanitize_required_pruned_to_existing_properties() {
        let sanitized = sanitize_schema(&serde_json::json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "required": ["a", "ghost"]
        }));
        assert_eq!(sanitized["required"], serde_json::json!(["a"]));
    }

    #[test]
    fn test_tool_use_gets_skip_signature_for_gemini() {
        crate::format::signature_cache::clear_caches();

        let mut request = create_test_request("gemini-3-flash", "Continue");
        request.messages = vec![
            Message {
                role: Role::User,
                content: MessageContent::Text("Use a tool".to_string()),
            },
            Message {
                role: Role::Assistant,
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "toolu_convert_test".to_string(),
                    name: "get_weather".to_string(),
                    input: serde_json::json!({"location": "NYC"}),
                }]),
            },
        ];

        let google_req = convert_request(&request);
        let assistant = &google_req.contents[1];
        assert_eq!(assistant.role, "model");

        let has_skip = assistant.parts.iter().any(|p| {
            matches!(p, Part::FunctionCall(fc)
                if fc.thought_signature.as_deref() == Some(GEMINI_SKIP_SIGNATURE))
        });
        assert!(has_skip, "uncached tool call should carry the skip sentinel");
    }

    #[test]
    fn test_foreign_thinking_signature_dropped_for_gemini() {
        crate::format::signature_cache::clear_caches();

        let claude_sig = "f".repeat(MIN_SIGNATURE_LENGTH);
        crate::format::signature_cache::cache_thinking_signature(&claude_sig, ModelFamily::Claude);

        let mut request = create_test_request("gemini-3-pro-high", "Continue");
        request.messages.push(Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![
                ContentBlock::Thinking {
                    thinking: "prior reasoning".to_string(),
                    signature: Some(claude_sig),
                },
                ContentBlock::Text {
                    text: "answer".to_string(),
                    cache_control: None,
                },
            ]),
        });

        let google_req = convert_request(&request);
        let assistant = &google_req.contents[1];

        // Thinking block is gone, text survives
        assert_eq!(assistant.parts.len(), 1);
        assert!(matches!(assistant.parts[0], Part::Text(_)));
    }
}
