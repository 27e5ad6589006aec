//! Request validation
//!
//! Turns a raw request body into a [`CompletionRequest`] or a list of field
//! problems. The body is inspected as a JSON value rather than deserialized
//! into a struct so that every problem can be reported at once, keyed by
//! field.
//!
//! Accepted shape:
//!
//! ```json
//! {
//!   "messages": [{ "role": "user", "content": "Hi" }],
//!   "model": "gpt-4-turbo",
//!   "temperature": 0.7,
//!   "max_tokens": 2048,
//!   "stream": true
//! }
//! ```
//!
//! Everything except `messages` is optional; `null` counts as absent. Unknown
//! fields are ignored.

use serde_json::{Map, Value};

use super::error::{RelayError, ValidationDetails};
use crate::backend::{CompletionRequest, ProviderKind};
use crate::messages::{ChatMessage, MessageRole};

/// Summary message of every validation failure
pub const INVALID_REQUEST: &str = "Invalid request format";

/// Models accepted when no list is configured
pub const DEFAULT_ALLOWED_MODELS: [&str; 3] = ["gpt-4-turbo", "gpt-4", "gpt-3.5-turbo"];

/// Groq model used when nothing else is configured
pub const GROQ_DEFAULT_MODEL: &str = "mixtral-8x7b-32768";

/// Ollama model used when nothing else is configured
pub const OLLAMA_DEFAULT_MODEL: &str = "llama3.2";

/// Temperature range accepted by providers
const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);

/// Validation rules and request defaults
#[derive(Clone, Debug, PartialEq)]
pub struct RequestPolicy {
    /// Model used when the request names none
    pub default_model: String,
    /// Accepted models; empty accepts any
    pub allowed_models: Vec<String>,
    /// Temperature used when the request gives none
    pub default_temperature: f32,
    /// Token limit used when the request gives none
    pub default_max_tokens: u32,
    /// Largest accepted `max_tokens`
    pub max_tokens_limit: u32,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_ALLOWED_MODELS[0].to_string(),
            allowed_models: DEFAULT_ALLOWED_MODELS.iter().map(ToString::to_string).collect(),
            default_temperature: 0.7,
            default_max_tokens: 2048,
            max_tokens_limit: 4096,
        }
    }
}

impl RequestPolicy {
    /// Defaults suited to a provider
    ///
    /// OpenAI keeps the default allow-list. Groq accepts its default model
    /// with a cooler temperature and shorter replies. Ollama serves whatever
    /// models are pulled locally, so any name is accepted.
    #[must_use]
    pub fn for_provider(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::OpenAi => Self::default(),
            ProviderKind::Groq => Self {
                default_model: GROQ_DEFAULT_MODEL.to_string(),
                allowed_models: vec![GROQ_DEFAULT_MODEL.to_string()],
                default_temperature: 0.5,
                default_max_tokens: 1024,
                ..Self::default()
            },
            ProviderKind::Ollama => Self {
                default_model: OLLAMA_DEFAULT_MODEL.to_string(),
                allowed_models: Vec::new(),
                ..Self::default()
            },
        }
    }
}

/// A request that passed validation, with defaults filled in
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedRequest {
    /// What to send upstream
    pub completion: CompletionRequest,
    /// Stream frames (true) or answer with one JSON body
    pub stream: bool,
}

impl RequestPolicy {
    /// Validate a raw request body
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Validation`. `details` is `None` only when the
    /// body is not JSON at all.
    pub fn validate(&self, body: &[u8]) -> Result<ValidatedRequest, RelayError> {
        let value: Value = serde_json::from_slice(body).map_err(|e| RelayError::Validation {
            message: format!("{INVALID_REQUEST}: body is not valid JSON ({e})"),
            details: None,
        })?;

        self.validate_value(&value)
            .map_err(|details| RelayError::Validation {
                message: INVALID_REQUEST.to_string(),
                details: Some(details),
            })
    }

    /// Validate an already parsed body
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn validate_value(&self, value: &Value) -> Result<ValidatedRequest, ValidationDetails> {
        let mut details = ValidationDetails::default();

        let Some(body) = value.as_object() else {
            details.form("Expected object");
            return Err(details);
        };

        let messages = validate_messages(body.get("messages"), &mut details);
        let model = self.validate_model(field(body, "model"), &mut details);
        let temperature = validate_temperature(field(body, "temperature"), &mut details)
            .unwrap_or(self.default_temperature);
        let max_tokens = self
            .validate_max_tokens(field(body, "max_tokens"), &mut details)
            .unwrap_or(self.default_max_tokens);
        let stream = match field(body, "stream") {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                details.field("stream", "Expected boolean");
                true
            }
        };

        if !details.is_empty() {
            return Err(details);
        }

        Ok(ValidatedRequest {
            completion: CompletionRequest::new(messages, model)
                .with_temperature(temperature)
                .with_max_tokens(max_tokens),
            stream,
        })
    }

    fn validate_model(&self, value: Option<&Value>, details: &mut ValidationDetails) -> String {
        match value {
            None => self.default_model.clone(),
            Some(Value::String(model)) => {
                if !self.allowed_models.is_empty() && !self.allowed_models.contains(model) {
                    let expected = self
                        .allowed_models
                        .iter()
                        .map(|m| format!("'{m}'"))
                        .collect::<Vec<_>>()
                        .join(" | ");
                    details.field(
                        "model",
                        format!("Invalid enum value. Expected {expected}, received '{model}'"),
                    );
                }
                model.clone()
            }
            Some(_) => {
                details.field("model", "Expected string");
                String::new()
            }
        }
    }

    fn validate_max_tokens(
        &self,
        value: Option<&Value>,
        details: &mut ValidationDetails,
    ) -> Option<u32> {
        let value = value?;
        let Some(number) = value.as_f64() else {
            details.field("max_tokens", "Expected number");
            return None;
        };
        if number.fract() != 0.0 {
            details.field("max_tokens", "Expected integer");
            return None;
        }
        if number < 1.0 {
            details.field("max_tokens", "Number must be greater than or equal to 1");
            return None;
        }
        if number > f64::from(self.max_tokens_limit) {
            details.field(
                "max_tokens",
                format!(
                    "Number must be less than or equal to {}",
                    self.max_tokens_limit
                ),
            );
            return None;
        }
        // Integral and within 1..=limit, so the cast is exact
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(number as u32)
    }
}

/// A present, non-null field
fn field<'a>(body: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    body.get(name).filter(|v| !v.is_null())
}

fn validate_messages(value: Option<&Value>, details: &mut ValidationDetails) -> Vec<ChatMessage> {
    let items = match value {
        None | Some(Value::Null) => {
            details.field("messages", "Required");
            return Vec::new();
        }
        Some(Value::Array(items)) => items,
        Some(_) => {
            details.field("messages", "Expected array");
            return Vec::new();
        }
    };

    if items.is_empty() {
        details.field("messages", "Array must contain at least 1 element(s)");
        return Vec::new();
    }

    let mut messages = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let Some(object) = item.as_object() else {
            details.field("messages", format!("messages[{index}]: Expected object"));
            continue;
        };

        let role = match object.get("role").and_then(Value::as_str) {
            Some("user") => Some(MessageRole::User),
            Some("assistant") => Some(MessageRole::Assistant),
            Some("system") => Some(MessageRole::System),
            _ => {
                details.field(
                    "messages",
                    format!(
                        "messages[{index}].role: Invalid enum value. Expected 'user' | 'assistant' | 'system'"
                    ),
                );
                None
            }
        };

        let content = match object.get("content") {
            Some(Value::String(content)) if !content.is_empty() => Some(content.clone()),
            Some(Value::String(_)) => {
                details.field(
                    "messages",
                    format!("messages[{index}].content: String must contain at least 1 character(s)"),
                );
                None
            }
            _ => {
                details.field(
                    "messages",
                    format!("messages[{index}].content: Expected string"),
                );
                None
            }
        };

        if let (Some(role), Some(content)) = (role, content) {
            messages.push(ChatMessage::new(role, content));
        }
    }
    messages
}

fn validate_temperature(value: Option<&Value>, details: &mut ValidationDetails) -> Option<f32> {
    let value = value?;
    let Some(number) = value.as_f64() else {
        details.field("temperature", "Expected number");
        return None;
    };
    let (min, max) = TEMPERATURE_RANGE;
    if number < min {
        details.field("temperature", "Number must be greater than or equal to 0");
        return None;
    }
    if number > max {
        details.field("temperature", "Number must be less than or equal to 2");
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    Some(number as f32)
}
