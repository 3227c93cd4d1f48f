//! Thinking-signature bookkeeping for cross-family conversations.
//!
//! Gemini validates `thoughtSignature` values it issued itself; Claude Code
//! routinely strips them from tool results. The caches here let a later turn
//! restore a stripped signature by tool id, and let the translator drop
//! signatures that crossed the Claude/Gemini family boundary.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

/// Minimum valid thinking signature length. Anything shorter is noise.
pub const MIN_SIGNATURE_LENGTH: usize = 50;

/// Cache TTL for signatures (2 hours)
const SIGNATURE_CACHE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Sentinel recognised by Gemini as "skip validation of this signature".
pub const GEMINI_SKIP_SIGNATURE: &str = "skip_thought_signature_validator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Claude,
    Gemini,
}

impl ModelFamily {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    timestamp: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            timestamp: Instant::now(),
        }
    }

    fn is_expired(&self) -> bool {
        self.timestamp.elapsed() > SIGNATURE_CACHE_TTL
    }
}

static TOOL_SIGNATURE_CACHE: LazyLock<RwLock<HashMap<String, CacheEntry<String>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

static THINKING_SIGNATURE_CACHE: LazyLock<RwLock<HashMap<String, CacheEntry<ModelFamily>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Remember which signature an upstream functionCall carried, keyed by the
/// tool_use id it was surfaced under.
pub fn cache_tool_signature(tool_use_id: &str, signature: &str) {
    if tool_use_id.is_empty() || signature.len() < MIN_SIGNATURE_LENGTH {
        return;
    }

    TOOL_SIGNATURE_CACHE.write().insert(
        tool_use_id.to_string(),
        CacheEntry::new(signature.to_string()),
    );
}

/// Look up the signature for a tool_use id, dropping expired entries.
pub fn get_cached_tool_signature(tool_use_id: &str) -> Option<String> {
    if tool_use_id.is_empty() {
        return None;
    }

    let mut cache = TOOL_SIGNATURE_CACHE.write();
    if let Some(entry) = cache.get(tool_use_id) {
        if entry.is_expired() {
            cache.remove(tool_use_id);
            return None;
        }
        return Some(entry.value.clone());
    }
    None
}

/// Record the family that produced a thinking signature.
pub fn cache_thinking_signature(signature: &str, family: ModelFamily) {
    if signature.len() < MIN_SIGNATURE_LENGTH {
        return;
    }

    THINKING_SIGNATURE_CACHE
        .write()
        .insert(signature.to_string(), CacheEntry::new(family));
}

pub fn get_cached_signature_family(signature: &str) -> Option<ModelFamily> {
    if signature.is_empty() {
        return None;
    }

    let mut cache = THINKING_SIGNATURE_CACHE.write();
    if let Some(entry) = cache.get(signature) {
        if entry.is_expired() {
            cache.remove(signature);
            return None;
        }
        return Some(entry.value);
    }
    None
}

/// Whether a signature may be replayed to a target family.
///
/// Claude validates its own signatures, so anything goes. Gemini rejects
/// foreign signatures, so only signatures known to come from Gemini pass.
pub fn is_signature_compatible(signature: &str, target_family: ModelFamily) -> bool {
    if target_family == ModelFamily::Claude {
        return true;
    }

    match get_cached_signature_family(signature) {
        Some(source_family) => source_family == target_family,
        None => false,
    }
}

#[cfg(test)]
pub fn clear_caches() {
    TOOL_SIGNATURE_CACHE.write().clear();
    THINKING_SIGNATURE_CACHE.write().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_signature_roundtrip() {
        clear_caches();

        let signature = "a".repeat(MIN_SIGNATURE_LENGTH);
        assert!(get_cached_tool_signature("toolu_01").is_none());

        cache_tool_signature("toolu_01", &signature);
        assert_eq!(get_cached_tool_signature("toolu_01"), Some(signature));
    }

    #[test]
    fn test_short_signatures_not_cached() {
        clear_caches();

        let short = "a".repeat(MIN_SIGNATURE_LENGTH - 1);
        cache_tool_signature("toolu_short", &short);
        assert!(get_cached_tool_signature("toolu_short").is_none());

        cache_thinking_signature(&short, ModelFamily::Gemini);
        assert!(get_cached_signature_family(&short).is_none());
    }

    #[test]
    fn test_claude_accepts_any_signature() {
        clear_caches();

        let signature = "c".repeat(MIN_SIGNATURE_LENGTH);
        assert!(is_signature_compatible(&signature, ModelFamily::Claude));

        cache_thinking_signature(&signature, ModelFamily::Gemini);
        assert!(is_signature_compatible(&signature, ModelFamily::Claude));
    }

    #[test]
    fn test_gemini_rejects_foreign_signatures() {
        clear_caches();

        // Unknown origin: rejected
        let unknown = "d".repeat(MIN_SIGNATURE_LENGTH);
        assert!(!is_signature_compatible(&unknown, ModelFamily::Gemini));

        // Gemini-sourced: accepted
        cache_thinking_signature(&unknown, ModelFamily::Gemini);
        assert!(is_signature_compatible(&unknown, ModelFamily::Gemini));

        // Claude-sourced: rejected
        let claude_sig = "e".repeat(MIN_SIGNATURE_LENGTH);
        cache_thinking_signature(&claude_sig, ModelFamily::Claude);
        assert!(!is_signature_compatible(&claude_sig, ModelFamily::Gemini));
    }

    #[test]
    fn test_model_family_from_str() {
        assert_eq!(ModelFamily::from_str("claude"), Some(ModelFamily::Claude));
        assert_eq!(ModelFamily::from_str("GEMINI"), Some(ModelFamily::Gemini));
        assert_eq!(ModelFamily::from_str("unknown"), None);
    }
}
