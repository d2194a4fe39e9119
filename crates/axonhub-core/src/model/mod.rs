//! The neutral model (C1): canonical request, response, message, content
//! parts, tools, usage, and error types independent of any wire dialect.

pub mod error;
pub mod message;
pub mod request;
pub mod response;
pub mod tool;

pub use error::{ErrorDetail, ErrorEnvelope, ResponseError};
pub use message::{
    CacheControl, CacheControlType, ContentPart, FunctionCall, ImageUrl, Message, MessageContent,
    Role, ToolCall, ToolCallType,
};
pub use request::{
    ApiFormat, Modality, RawRequest, ReasoningEffort, Request, RequestType, RerankParams,
    ThinkingConfig, ThinkingType,
};
pub use response::{
    Choice, CompletionTokensDetails, FinishReason, PromptTokensDetails, RerankDocument,
    RerankResult, Response, Usage, OBJECT_CHAT_COMPLETION, OBJECT_CHAT_COMPLETION_CHUNK,
    OBJECT_DONE,
};
pub use tool::{
    FunctionDefinition, ImageGenerationParams, NamedToolChoice, Tool, ToolChoice, ToolChoiceFunction,
    ToolChoiceMode,
};
