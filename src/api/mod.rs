//! API Module
//!
//! Wire types for each provider family.

pub mod anthropic;
pub mod completion;
pub mod gemini;

pub use anthropic::{MessagesRequest, MessagesResponse};
pub use completion::{CompletionRequest, CompletionResponse, Message, MessageContent};
pub use gemini::{GenerateContentRequest, GenerateContentResponse};
