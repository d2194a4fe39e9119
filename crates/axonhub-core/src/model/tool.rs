use serde::{Deserialize, Serialize};

/// A tool definition. Known types are modeled; anything else round-trips
/// opaquely through the catch-all variant so new provider tool types pass
/// through the gateway unharmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Tool {
    Function {
        function: FunctionDefinition,
    },
    ImageGeneration {
        #[serde(flatten)]
        params: ImageGenerationParams,
    },
    WebSearch {},
    GoogleSearch {},
    UrlContext {},
    CodeExecution {},
    #[serde(untagged)]
    Other(serde_json::Value),
}

impl Tool {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Tool::Function {
            function: FunctionDefinition {
                name: name.into(),
                description: Some(description.into()),
                parameters: Some(parameters),
                strict: None,
            },
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Tool::Function { function } => Some(&function.name),
            _ => None,
        }
    }

    pub fn is_image_generation(&self) -> bool {
        matches!(self, Tool::ImageGeneration { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageGenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// `high` maps to provider-specific HD tiers; anything else is standard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
}

/// Neutral tool-choice: the three modes or a named function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(ToolChoiceMode),
    Named(NamedToolChoice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    None,
    Auto,
    Required,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedToolChoice {
    pub r#type: NamedToolChoiceType,
    pub function: ToolChoiceFunction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedToolChoiceType {
    Function,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

impl ToolChoice {
    pub fn auto() -> Self {
        ToolChoice::Mode(ToolChoiceMode::Auto)
    }

    pub fn named(name: impl Into<String>) -> Self {
        ToolChoice::Named(NamedToolChoice {
            r#type: NamedToolChoiceType::Function,
            function: ToolChoiceFunction { name: name.into() },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_function_tool_round_trip() {
        let raw = json!({
            "type": "function",
            "function": {
                "name": "calculate",
                "description": "Evaluate an arithmetic expression",
                "parameters": {
                    "type": "object",
                    "properties": {"expression": {"type": "string"}},
                    "required": ["expression"]
                }
            }
        });
        let tool: Tool = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(tool.name(), Some("calculate"));
        assert_eq!(serde_json::to_value(&tool).unwrap(), raw);
    }

    #[test]
    fn test_unknown_tool_type_round_trips_opaquely() {
        let raw = json!({"type": "computer_use", "display_width": 1024});
        let tool: Tool = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(tool, Tool::Other(_)));
        assert_eq!(serde_json::to_value(&tool).unwrap(), raw);
    }

    #[test]
    fn test_native_google_tools() {
        let tool: Tool = serde_json::from_value(json!({"type": "google_search"})).unwrap();
        assert_eq!(tool, Tool::GoogleSearch {});
    }

    #[test]
    fn test_tool_choice_forms() {
        let auto: ToolChoice = serde_json::from_str(r#""auto""#).unwrap();
        assert_eq!(auto, ToolChoice::auto());

        let named: ToolChoice =
            serde_json::from_str(r#"{"type":"function","function":{"name":"calculate"}}"#).unwrap();
        assert_eq!(named, ToolChoice::named("calculate"));

        assert_eq!(serde_json::to_string(&auto).unwrap(), r#""auto""#);
        assert_eq!(
            serde_json::to_value(&named).unwrap(),
            json!({"type": "function", "function": {"name": "calculate"}})
        );
    }
}
