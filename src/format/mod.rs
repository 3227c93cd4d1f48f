pub mod anthropic;
pub mod google;
pub mod signature_cache;
pub mod to_anthropic;
pub mod to_google;

pub use anthropic::{
    ContentBlock, ContentDelta, ErrorData, MessageDeltaData, MessageDeltaUsage, MessageStart,
    MessagesRequest, MessagesResponse, ModelInfo, ModelsResponse, Role, StopReason, StreamEvent,
    Usage,
};
pub use google::GenerateContentResponse;
pub use signature_cache::{
    MIN_SIGNATURE_LENGTH, ModelFamily, cache_thinking_signature, cache_tool_signature,
};
pub use to_anthropic::{build_response_from_events, convert_response};
pub use to_google::convert_request;
