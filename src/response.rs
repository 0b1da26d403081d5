//! Inbound response model for the evaluation server.
//!
//! The server answers with free-form chunks. Chunks that parse as JSON are
//! classified by their discriminator fields; anything else is passed through
//! verbatim so the display surface can still show it.

use serde::Serialize;
use serde_json::Value;

/// One decoded inbound unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    /// `{"status": "success", ...}`
    Success { message: Option<String> },
    /// `{"status": "error", ...}`
    ErrorResult { message: Option<String> },
    /// A document carrying a `result` field and no `status`.
    ValueResult { result: Value },
    /// Data that did not parse as JSON.
    Raw { text: String },
    /// Valid JSON that matched none of the known shapes.
    Unclassified { payload: Value },
}

impl Response {
    /// Decode a single inbound unit.
    ///
    /// Returns `None` for empty or whitespace-only input; such units are
    /// dropped without producing an event.
    pub fn decode(unit: &str) -> Option<Self> {
        if unit.trim().is_empty() {
            return None;
        }

        match serde_json::from_str::<Value>(unit) {
            Ok(value) => Some(Self::classify(value)),
            Err(_) => Some(Response::Raw {
                text: unit.to_string(),
            }),
        }
    }

    /// Classify an already-parsed document.
    ///
    /// A `status` field takes precedence over `result`: an unknown status
    /// makes the whole document unclassified even when it carries a result.
    pub fn classify(value: Value) -> Self {
        let Some(object) = value.as_object() else {
            return Response::Unclassified { payload: value };
        };

        let message = object
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);

        match object.get("status") {
            Some(Value::String(status)) if status == "success" => Response::Success { message },
            Some(Value::String(status)) if status == "error" => {
                Response::ErrorResult { message }
            }
            Some(_) => Response::Unclassified { payload: value },
            None => match object.get("result") {
                Some(result) => Response::ValueResult {
                    result: result.clone(),
                },
                None => Response::Unclassified { payload: value },
            },
        }
    }

    /// Short label used in logs and status text.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Success { .. } => "success",
            Response::ErrorResult { .. } => "error",
            Response::ValueResult { .. } => "result",
            Response::Raw { .. } => "raw",
            Response::Unclassified { .. } => "unclassified",
        }
    }

    /// Check if the server reported a failure.
    pub fn is_error(&self) -> bool {
        matches!(self, Response::ErrorResult { .. })
    }

    /// Render the response as display text for an output surface.
    pub fn display_text(&self) -> String {
        match self {
            Response::Success { message } => message.clone().unwrap_or_else(|| "ok".to_string()),
            Response::ErrorResult { message } => format!(
                "error: {}",
                message.as_deref().unwrap_or("evaluation failed")
            ),
            Response::ValueResult { result } => render_value(result),
            Response::Raw { text } => text.clone(),
            Response::Unclassified { payload } => render_value(payload),
        }
    }
}

/// Strings are shown bare, everything else as compact JSON.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
