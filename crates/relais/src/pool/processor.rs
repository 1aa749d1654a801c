//! Mapping between input lines and service requests.

use serde_json::Value;

use crate::bridge::protocol::Request;

/// Turns lines into requests and answers back into lines.
///
/// Shared by every worker of a run, so it must be stateless or internally
/// synchronized.
pub trait LineProcessor: Send + Sync + 'static {
    /// Request for `line`, or `None` to copy the line through without a call.
    fn request(&self, line: &str) -> Option<Request>;

    /// Output line for `data`, or `None` to keep the original line.
    fn response(&self, line: &str, data: &Value) -> Option<String>;
}

/// Sends each non-blank line as one string field of a fixed command and
/// expects a string back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextCommand {
    pub command: String,
    pub field: String,
}

impl TextCommand {
    pub const DEFAULT_FIELD: &'static str = "text";

    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            field: Self::DEFAULT_FIELD.to_string(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }
}

impl LineProcessor for TextCommand {
    fn request(&self, line: &str) -> Option<Request> {
        let text = line.trim();
        if text.is_empty() {
            return None;
        }
        Some(Request::new(self.command.clone()).with_field(self.field.clone(), text))
    }

    fn response(&self, _line: &str, data: &Value) -> Option<String> {
        data.as_str().map(str::to_string)
    }
}
