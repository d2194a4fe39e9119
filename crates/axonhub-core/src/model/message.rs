//! The neutral message model.
//!
//! A [`Message`] is dialect-independent: every inbound transformer produces
//! these and every outbound transformer consumes them. Content is either a
//! bare string or an ordered sequence of typed parts; the two forms are
//! normalized on the wire (a single `text` part serializes as the plain
//! string).

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One typed span of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Opaque provider data whose plaintext is withheld. The `data` string
    /// must round-trip bit-exact (see [`crate::codec`] for foreign payloads
    /// smuggled through this slot).
    RedactedThinking {
        data: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Message content: a bare string or an ordered part sequence.
///
/// Wire normalization: `Text(s)` and `Parts([Text{s}])` serialize to the
/// same JSON string; an empty part sequence serializes as `null`. The
/// enclosing [`Message`] omits the field entirely when content is absent.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text(text.into())
    }

    pub fn parts(parts: Vec<ContentPart>) -> Self {
        MessageContent::Parts(parts)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    /// The single-string view, if this content is one text span.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(text),
            MessageContent::Parts(parts) => match parts.as_slice() {
                [ContentPart::Text { text }] => Some(text),
                _ => None,
            },
        }
    }

    /// All text spans concatenated, ignoring non-text parts.
    pub fn joined_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// The part-sequence view; a bare string becomes one text part.
    pub fn into_parts(self) -> Vec<ContentPart> {
        match self {
            MessageContent::Text(text) => vec![ContentPart::Text { text }],
            MessageContent::Parts(parts) => parts,
        }
    }

    pub fn push(&mut self, part: ContentPart) {
        let mut parts = std::mem::replace(self, MessageContent::Parts(Vec::new())).into_parts();
        parts.push(part);
        *self = MessageContent::Parts(parts);
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_owned())
    }
}

impl Serialize for MessageContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MessageContent::Text(text) => serializer.serialize_str(text),
            MessageContent::Parts(parts) => match parts.as_slice() {
                [] => serializer.serialize_none(),
                [ContentPart::Text { text }] => serializer.serialize_str(text),
                _ => parts.serialize(serializer),
            },
        }
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Parts(Vec<ContentPart>),
        }

        match Option::<Repr>::deserialize(deserializer)? {
            Some(Repr::Text(text)) => Ok(MessageContent::Text(text)),
            Some(Repr::Parts(parts)) => Ok(MessageContent::Parts(parts)),
            None => Ok(MessageContent::Parts(Vec::new())),
        }
    }
}

/// OpenAI-style flat tool call, kept alongside part-form `tool_use` for
/// dialects that speak the legacy shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub r#type: ToolCallType,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallType {
    Function,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON-encoded arguments, exactly as the provider emitted them.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheControl {
    pub r#type: CacheControlType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheControlType {
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    /// Reasoning exposed as a separate channel (OpenRouter/NanoGPT style).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl Message {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            content: None,
            tool_calls: None,
            refusal: None,
            reasoning_content: None,
            name: None,
            cache_control: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_text(Role::Assistant, text)
    }

    fn with_text(role: Role, text: impl Into<String>) -> Self {
        let mut message = Self::new(role);
        message.content = Some(MessageContent::text(text));
        message
    }

    /// A `role=tool` message carries exactly one `tool_result` part.
    pub fn tool_result(id: impl Into<String>, output: impl Into<String>, is_error: bool) -> Self {
        let mut message = Self::new(Role::Tool);
        message.content = Some(MessageContent::Parts(vec![ContentPart::ToolResult {
            id: id.into(),
            output: output.into(),
            is_error: is_error.then_some(true),
        }]));
        message
    }

    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content = Some(content);
        self
    }

    pub fn text(&self) -> Option<String> {
        self.content.as_ref().map(MessageContent::joined_text)
    }

    pub fn parts(&self) -> &[ContentPart] {
        match &self.content {
            Some(MessageContent::Parts(parts)) => parts,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_text_part_normalizes_to_string() {
        let bare = Message::user("hello");
        let parted = Message::new(Role::User)
            .with_content(MessageContent::Parts(vec![ContentPart::text("hello")]));

        let left = serde_json::to_value(&bare).unwrap();
        let right = serde_json::to_value(&parted).unwrap();
        assert_eq!(left, right);
        assert_eq!(left, json!({"role": "user", "content": "hello"}));
    }

    #[test]
    fn test_empty_parts_serialize_as_null_and_absent_is_omitted() {
        let empty = Message::new(Role::Assistant).with_content(MessageContent::Parts(Vec::new()));
        assert_eq!(
            serde_json::to_value(&empty).unwrap(),
            json!({"role": "assistant", "content": null})
        );

        let absent = Message::new(Role::Assistant);
        assert_eq!(
            serde_json::to_string(&absent).unwrap(),
            r#"{"role":"assistant"}"#
        );
    }

    #[test]
    fn test_deserialize_both_content_forms() {
        let from_string: Message =
            serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        let from_parts: Message =
            serde_json::from_str(r#"{"role":"user","content":[{"type":"text","text":"hi"}]}"#)
                .unwrap();
        assert_eq!(from_string.content.unwrap().as_text(), Some("hi"));
        assert_eq!(from_parts.content.unwrap().as_text(), Some("hi"));
    }

    #[test]
    fn test_message_round_trip_with_mixed_parts() {
        let message = Message::new(Role::Assistant).with_content(MessageContent::Parts(vec![
            ContentPart::Thinking {
                thinking: "adding the numbers".into(),
                signature: Some("sig-1".into()),
            },
            ContentPart::text("the answer is 128"),
            ContentPart::ToolUse {
                id: "toolu_1".into(),
                name: "calculate".into(),
                input: json!({"expression": "15 * 7 + 23"}),
            },
        ]));

        let rendered = serde_json::to_string(&message).unwrap();
        let parsed: Message = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_redacted_thinking_data_survives_untouched() {
        let raw = r#"{"role":"assistant","content":[{"type":"redacted_thinking","data":"EpgBCk3lv+/x"}]}"#;
        let message: Message = serde_json::from_str(raw).unwrap();
        match &message.parts()[0] {
            ContentPart::RedactedThinking { data } => assert_eq!(data, "EpgBCk3lv+/x"),
            other => panic!("unexpected part: {other:?}"),
        }
        let rendered = serde_json::to_string(&message).unwrap();
        assert_eq!(rendered, raw);
    }

    #[test]
    fn test_tool_message_shape() {
        let message = Message::tool_result("call_1", "128", false);
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.parts().len(), 1);
        let rendered = serde_json::to_value(&message).unwrap();
        assert_eq!(
            rendered["content"][0],
            json!({"type": "tool_result", "id": "call_1", "output": "128"})
        );
    }
}
