//! Input shape of the agent's `AskUserQuestion` tool.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

/// Tool name the agent uses to pause for user input.
pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

/// Request payload of an `AskUserQuestion` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionRequest {
    #[serde(default, deserialize_with = "null_as_default")]
    pub questions: Vec<QuestionItem>,
}

/// A single question presented to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionItem {
    #[serde(default, deserialize_with = "null_as_default")]
    pub question: String,
    /// Short label shown above the question.
    #[serde(default, deserialize_with = "null_as_default")]
    pub header: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: Vec<QuestionOption>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub multi_select: bool,
}

/// A predefined answer option.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    #[serde(default, deserialize_with = "null_as_default")]
    pub label: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
}

/// Explicit `null` decodes like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl QuestionRequest {
    /// Decode a tool input. `None` when it is not a question request or
    /// carries no questions.
    pub fn from_tool_input(input: &RawValue) -> Option<Self> {
        serde_json::from_str::<QuestionRequest>(input.get())
            .ok()
            .filter(|request| !request.questions.is_empty())
    }

    /// Decode a persisted `pending_question` payload.
    pub fn from_pending(payload: &str) -> Option<Self> {
        serde_json::from_str::<QuestionRequest>(payload)
            .ok()
            .filter(|request| !request.questions.is_empty())
    }
}
