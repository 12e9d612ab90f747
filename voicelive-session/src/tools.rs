use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::client::{PendingToolCall, RealtimeClient};
use crate::error::{SessionError, ToolError};
use crate::protocol::{ClientItem, ToolDeclaration};
use crate::transcript::Transcript;

const SEARCH_DESCRIPTION: &str = "Search the knowledge base. The knowledge base is in English, \
translate to and from English if needed. Results are formatted as a source name first in square \
brackets, followed by the text content, and a line with '-----' at the end of each result.";

const RESULT_SEPARATOR: &str = "\n-----\n";

// ── Tool identifiers and arguments ──────────────────────────────────────────

/// The closed set of tools the session can declare and execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    GetTime,
    Search,
}

impl ToolKind {
    pub const ALL: [ToolKind; 2] = [ToolKind::GetTime, ToolKind::Search];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::GetTime => "get_time",
            ToolKind::Search => "search",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn declaration(self) -> ToolDeclaration {
        match self {
            ToolKind::GetTime => {
                ToolDeclaration::function(self.name(), None, "Get the current time.")
            }
            ToolKind::Search => ToolDeclaration::function(
                self.name(),
                Some(parameters_schema::<SearchArgs>()),
                SEARCH_DESCRIPTION,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchArgs {
    /// Search query
    pub query: String,
}

fn parameters_schema<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null);
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    schema
}

/// A parsed, typed tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    GetTime,
    Search(SearchArgs),
}

impl ToolCall {
    pub fn parse(function_name: &str, arguments: &str) -> Result<Self, ToolError> {
        let kind = ToolKind::from_name(function_name)
            .ok_or_else(|| ToolError::UnknownTool(function_name.to_string()))?;
        match kind {
            ToolKind::GetTime => Ok(ToolCall::GetTime),
            ToolKind::Search => serde_json::from_str::<SearchArgs>(arguments)
                .map(ToolCall::Search)
                .map_err(|e| ToolError::InvalidArgs {
                    tool: function_name.to_string(),
                    reason: e.to_string(),
                }),
        }
    }
}

// ── Search collaborator ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFields {
    pub content: String,
    pub identifier: String,
}

impl Default for SearchFields {
    fn default() -> Self {
        Self {
            content: "chunk".to_string(),
            identifier: "chunk_id".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOptions {
    pub top: usize,
    pub query_type: String,
    pub semantic_configuration: String,
    pub select: Vec<String>,
}

impl SearchOptions {
    pub fn semantic(fields: &SearchFields) -> Self {
        Self {
            top: 5,
            query_type: "semantic".to_string(),
            semantic_configuration: "default".to_string(),
            select: vec![fields.content.clone(), fields.identifier.clone()],
        }
    }
}

pub type SearchDocument = Map<String, Value>;

/// External document index queried by the `search` tool.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Return matching documents in ranking order.
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> anyhow::Result<Vec<SearchDocument>>;
}

fn field_text(document: &SearchDocument, field: &str) -> String {
    match document.get(field) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

pub fn format_search_results(documents: &[SearchDocument], fields: &SearchFields) -> String {
    documents
        .iter()
        .map(|doc| {
            format!(
                "[{}]: {}{}",
                field_text(doc, &fields.identifier),
                field_text(doc, &fields.content),
                RESULT_SEPARATOR
            )
        })
        .collect()
}

/// Long en-US style timestamp, e.g. `Wednesday, October 16, 2024 at 09:27:03 AM UTC`.
pub fn format_timestamp<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    now.format("%A, %B %-d, %Y at %I:%M:%S %p %Z").to_string()
}

// ── Dispatcher ──────────────────────────────────────────────────────────────

/// Executes completed function calls and reports their output to the session.
pub struct ToolDispatcher {
    search: Option<Arc<dyn SearchBackend>>,
    fields: SearchFields,
    transcript: Transcript,
}

impl ToolDispatcher {
    pub fn new(
        search: Option<Arc<dyn SearchBackend>>,
        fields: SearchFields,
        transcript: Transcript,
    ) -> Self {
        Self {
            search,
            fields,
            transcript,
        }
    }

    pub async fn execute(&self, call: &ToolCall) -> Result<String, ToolError> {
        match call {
            ToolCall::GetTime => Ok(format_timestamp(&Local::now())),
            ToolCall::Search(args) => {
                let backend = self.search.as_ref().ok_or(ToolError::SearchUnavailable)?;
                self.transcript
                    .push_status(format!("Searching [{}]...", args.query));
                let options = SearchOptions::semantic(&self.fields);
                let documents = backend
                    .search(&args.query, &options)
                    .await
                    .map_err(|e| ToolError::Search(format!("{e:#}")))?;
                info!(query = %args.query, results = documents.len(), "Search tool completed");
                Ok(format_search_results(&documents, &self.fields))
            }
        }
    }

    /// Run the call, send its output and request a follow-up response.
    ///
    /// Tool failures reach the model as an `Error: ...` output so they are
    /// distinguishable from an empty result.
    pub async fn dispatch(
        &self,
        client: &dyn RealtimeClient,
        call: PendingToolCall,
    ) -> Result<(), SessionError> {
        let result = match ToolCall::parse(&call.function_name, &call.arguments) {
            Ok(parsed) => self.execute(&parsed).await,
            Err(e) => Err(e),
        };
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    call_id = %call.call_id,
                    tool = %call.function_name,
                    error = %e,
                    "Tool call failed"
                );
                format!("Error: {}", e)
            }
        };

        client
            .send_item(ClientItem::function_output(call.call_id, output))
            .await?;
        client.generate_response(None).await
    }
}
