//! ms-protocol: Shared types for the streaming messages client.
//!
//! Content fragments, stream envelopes and request DTOs used by the
//! decoder, the HTTP client and any frontend.

pub mod content;
pub mod message;
pub mod request;

pub use content::{ContentBlock, ImageSource, ToolInput};
pub use message::{ApiError, Envelope, EnvelopeKind, StopReason, Usage};
pub use request::{Message, MessageContent, MessageRequest, Metadata, Role, Tool, ToolChoice};
