pub mod dispatcher;
pub mod project;
pub mod request;
pub mod reset;
pub mod sse;

pub use dispatcher::{DispatchOutcome, Dispatcher, EventStream};
pub use project::ProjectResolver;
pub use request::{build_envelope, build_headers};
pub use sse::{SseParser, create_message_stop, format_sse_event};

/// Cloud Code API endpoints, tried in order within one account attempt.
pub const ENDPOINTS: &[&str] = &[
    "https://daily-cloudcode-pa.sandbox.googleapis.com",
    "https://cloudcode-pa.googleapis.com",
];
