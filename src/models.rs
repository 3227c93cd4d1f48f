use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Model {
    // Claude models
    ClaudeOpus4_6Thinking,
    ClaudeOpus4_5Thinking,
    ClaudeSonnet4_5,
    ClaudeSonnet4_5Thinking,
    // Gemini 2.5 models
    Gemini25Flash,
    Gemini25FlashThinking,
    Gemini25Pro,
    // Gemini 3 models
    Gemini3Flash,
    Gemini3ProHigh,
    Gemini3ProLow,
}

impl Model {
    pub fn anthropic_id(&self) -> &'static str {
        match self {
            Model::ClaudeOpus4_6Thinking => "claude-opus-4-6-thinking",
            Model::ClaudeOpus4_5Thinking => "claude-opus-4-5-thinking",
            Model::ClaudeSonnet4_5 => "claude-sonnet-4-5",
            Model::ClaudeSonnet4_5Thinking => "claude-sonnet-4-5-thinking",
            Model::Gemini25Flash => "gemini-2.5-flash",
            Model::Gemini25FlashThinking => "gemini-2.5-flash-thinking",
            Model::Gemini25Pro => "gemini-2.5-pro",
            Model::Gemini3Flash => "gemini-3-flash",
            Model::Gemini3ProHigh => "gemini-3-pro-high",
            Model::Gemini3ProLow => "gemini-3-pro-low",
        }
    }

    pub fn all() -> &'static [Model] {
        &[
            Model::ClaudeOpus4_6Thinking,
            Model::ClaudeOpus4_5Thinking,
            Model::ClaudeSonnet4_5,
            Model::ClaudeSonnet4_5Thinking,
            Model::Gemini25Flash,
            Model::Gemini25FlashThinking,
            Model::Gemini25Pro,
            Model::Gemini3Flash,
            Model::Gemini3ProHigh,
            Model::Gemini3ProLow,
        ]
    }
}

pub fn get_model_family(model_name: &str) -> &'static str {
    let lower = model_name.to_lowercase();
    if lower.contains("claude") {
        "claude"
    } else if lower.contains("gemini") {
        "gemini"
    } else {
        "unknown"
    }
}

/// Resolve model aliases to their full model names.
pub fn resolve_model_alias(model: &str) -> &str {
    let lower = model.to_lowercase();

    // Dated model names (e.g. claude-opus-4-6-20251201)
    if lower.starts_with("claude-opus-4-6") || lower.starts_with("claude-opus-4.6") {
        return "claude-opus-4-6-thinking";
    }
    if lower.starts_with("claude-opus-4-5") || lower.starts_with("claude-opus-4.5") {
        return "claude-opus-4-5-thinking";
    }
    if lower.starts_with("claude-sonnet-4-5-thinking")
        || lower.starts_with("claude-sonnet-4.5-thinking")
    {
        return "claude-sonnet-4-5-thinking";
    }
    if lower.starts_with("claude-sonnet-4-5") || lower.starts_with("claude-sonnet-4.5") {
        return "claude-sonnet-4-5";
    }

    match lower.as_str() {
        "opus" | "opus-thinking" | "claude-opus" => "claude-opus-4-6-thinking",
        "sonnet" | "claude-sonnet" => "claude-sonnet-4-5",
        "sonnet-thinking" | "claude-sonnet-thinking" => "claude-sonnet-4-5-thinking",
        // Haiku is not available on Cloud Code, map to Gemini 3 Flash
        "haiku" | "claude-haiku" | "claude-haiku-4-5" => "gemini-3-flash",

        "flash" | "gemini-flash" => "gemini-2.5-flash",
        "flash-thinking" | "gemini-flash-thinking" => "gemini-2.5-flash-thinking",
        "pro" | "gemini-pro" => "gemini-2.5-pro",
        "3-flash" | "gemini3-flash" => "gemini-3-flash",
        "3-pro" | "3-pro-high" | "gemini3-pro" => "gemini-3-pro-high",
        "3-pro-low" | "gemini3-pro-low" => "gemini-3-pro-low",

        _ => model,
    }
}

/// Fallback model substituted at most once when every account is exhausted
/// on the primary model. Returns None if no fallback is configured.
pub fn get_fallback_model(model: &str) -> Option<&'static str> {
    match model {
        "gemini-3-pro-high" => Some("claude-opus-4-6-thinking"),
        "gemini-3-pro-low" => Some("claude-sonnet-4-5"),
        "gemini-3-flash" => Some("claude-sonnet-4-5-thinking"),
        "claude-opus-4-6-thinking" => Some("claude-opus-4-5-thinking"),
        "claude-opus-4-5-thinking" => Some("gemini-3-pro-high"),
        "claude-sonnet-4-5-thinking" => Some("gemini-3-flash"),
        "claude-sonnet-4-5" => Some("gemini-3-flash"),
        _ => None,
    }
}

/// Claude models need "thinking" in the name. Gemini 3+ models are all
/// thinking models regardless of name.
pub fn is_thinking_model(model_name: &str) -> bool {
    let lower = model_name.to_lowercase();

    if lower.contains("claude") && lower.contains("thinking") {
        return true;
    }

    if lower.contains("gemini") {
        if lower.contains("thinking") {
            return true;
        }
        if let Some(version_str) = lower.strip_prefix("gemini-")
            && let Some(version_num) = version_str.chars().next().and_then(|c| c.to_digit(10))
            && version_num >= 3
        {
            return true;
        }
    }

    false
}
