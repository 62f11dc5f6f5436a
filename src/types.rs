use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const WEATHER_TOOL: &str = "weather-data";
pub const GITHUB_PROFILE_TOOL: &str = "github-profile";
pub const LINKEDIN_PROFILE_TOOL: &str = "linkedin-profile";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherData {
    pub current_temperature: f64,
    #[serde(default)]
    pub current_rain: f64,
    #[serde(default)]
    pub current_time: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GithubProfile {
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub profile_url: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub num_repos: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkedInProfile {
    pub name: String,
    #[serde(default)]
    pub profile_url: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub connections: String,
}

/// Output of a tool the assistant ran, typed for the tools the widget knows
/// how to render. Anything else is carried as raw JSON.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolPayload {
    Weather(WeatherData),
    GithubProfile(GithubProfile),
    LinkedInProfile(LinkedInProfile),
    Unknown(Value),
}

impl ToolPayload {
    /// Picks the payload shape from the tool name. A known tool whose output
    /// does not match its shape degrades to `Unknown` instead of failing.
    pub fn from_output(tool_name: &str, output: Value) -> Self {
        fn typed<T: serde::de::DeserializeOwned>(
            output: Value,
            wrap: fn(T) -> ToolPayload,
        ) -> ToolPayload {
            match serde_json::from_value::<T>(output.clone()) {
                Ok(data) => wrap(data),
                Err(_) => ToolPayload::Unknown(output),
            }
        }

        match tool_name {
            WEATHER_TOOL => typed(output, ToolPayload::Weather),
            GITHUB_PROFILE_TOOL => typed(output, ToolPayload::GithubProfile),
            LINKEDIN_PROFILE_TOOL => typed(output, ToolPayload::LinkedInProfile),
            _ => ToolPayload::Unknown(output),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutput {
    pub name: String,
    pub args: Value,
    pub output: ToolPayload,
    pub call_id: Option<String>,
}

/// Payload of a chat message. Exactly one shape per kind.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageKind {
    User { content: String },
    Agent { content: String },
    ToolOutput(ToolOutput),
    AgentToolCall { calls: Vec<ToolCall> },
    Error { content: String },
}

impl MessageKind {
    pub fn label(&self) -> &'static str {
        match self {
            MessageKind::User { .. } => "user",
            MessageKind::Agent { .. } => "agent",
            MessageKind::ToolOutput(_) => "tool_output",
            MessageKind::AgentToolCall { .. } => "agent_tool_call",
            MessageKind::Error { .. } => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub kind: MessageKind,
}

impl ChatMessage {
    /// Text content for user, agent and error messages.
    pub fn content(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::User { content }
            | MessageKind::Agent { content }
            | MessageKind::Error { content } => Some(content),
            MessageKind::ToolOutput(_) | MessageKind::AgentToolCall { .. } => None,
        }
    }

    pub fn tool(&self) -> Option<&ToolOutput> {
        match &self.kind {
            MessageKind::ToolOutput(tool) => Some(tool),
            _ => None,
        }
    }

    pub fn tool_calls(&self) -> Option<&[ToolCall]> {
        match &self.kind {
            MessageKind::AgentToolCall { calls } => Some(calls),
            _ => None,
        }
    }
}

/// One decoded line of the assistant's response stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatEvent {
    Token { text: String },
    FinalResponse { text: String },
    ToolOutput(ToolOutput),
    AgentToolCall { calls: Vec<ToolCall> },
    Error { text: String },
}
