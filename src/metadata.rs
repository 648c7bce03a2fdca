//! Custom log metadata: the events shipped to the Log Analytics workspace.
//!
//! Every event carries a shared [`BaseMetadata`] record plus one [`EventKind`]
//! with the type-specific fields. The event kind determines the `Log-Type`
//! the event is filed under on the workspace side.
//!
//! Field names and casing are the wire contract with the ingestion endpoint.
//! Absent or empty string values are omitted from the JSON object entirely.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::ApplicationConfig;

/// Name of the JSON field holding the event timestamp.
///
/// Sent as the `time-generated-field` header so the workspace uses it as the
/// record's `TimeGenerated` value.
pub const TIMESTAMP_FIELD_NAME: &str = "Timestamp";

/// Log type of request events.
pub const REQUEST_LOG_TYPE: &str = "CustomLogRequestMetadata";

/// Log type of statistic events.
pub const STATISTIC_LOG_TYPE: &str = "CustomLogStatisticMetadata";

/// Maximum length of a log type name accepted by the workspace.
const MAX_LOG_TYPE_LEN: usize = 100;

/// Field names owned by the shared metadata record.
const RESERVED_FIELDS: &[&str] = &[
    TIMESTAMP_FIELD_NAME,
    "WorkspaceId",
    "WorkspaceName",
    "Server",
    "Region",
];

/// Errors raised while building custom events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    /// Log type is empty, too long, or contains characters the endpoint rejects
    #[error("invalid log type '{0}': expected 1-100 ASCII letters, digits or underscores")]
    InvalidLogType(String),

    /// Custom field collides with a field of the shared metadata record
    #[error("field '{0}' is reserved for shared metadata")]
    ReservedField(String),
}

/// Attributes shared by every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BaseMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_name: Option<String>,

    /// Server name, merged in from the application configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Region name, merged in from the application configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Fields of a request event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent_short: Option<String>,

    pub duration_sec: u32,
}

/// Fields of a statistic event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatisticFields {
    pub object_count: u64,
}

/// Free-form fields under a caller-chosen log type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomFields {
    #[serde(skip)]
    log_type: String,

    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl CustomFields {
    pub fn log_type(&self) -> &str {
        &self.log_type
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// The type-specific part of an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventKind {
    Request(RequestFields),
    Statistic(StatisticFields),
    Custom(CustomFields),
}

impl EventKind {
    /// The log type this kind of event is filed under.
    pub fn log_type(&self) -> &str {
        match self {
            EventKind::Request(_) => REQUEST_LOG_TYPE,
            EventKind::Statistic(_) => STATISTIC_LOG_TYPE,
            EventKind::Custom(custom) => &custom.log_type,
        }
    }
}

/// A single, immutable custom log event.
///
/// Serializes to one flat JSON object: `Timestamp`, the shared metadata and
/// the type-specific fields, in that order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "Timestamp")]
    timestamp: DateTime<Utc>,

    #[serde(flatten)]
    base: BaseMetadata,

    #[serde(flatten)]
    kind: EventKind,
}

impl Event {
    fn new(base: BaseMetadata, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            base,
            kind,
        }
    }

    pub fn log_type(&self) -> &str {
        self.kind.log_type()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn base(&self) -> &BaseMetadata {
        &self.base
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Fill in the process-wide server and region labels.
    ///
    /// Only labels present in the configuration are applied.
    pub fn with_application(mut self, application: &ApplicationConfig) -> Self {
        if let Some(server) = &application.server_name {
            self.base.server = Some(server.clone());
        }
        if let Some(region) = &application.region_name {
            self.base.region = Some(region.clone());
        }
        self
    }

    /// Serialize the event to a JSON object string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Trim a value; empty results count as absent.
fn strip(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Setters for the shared metadata record, available on every builder.
pub trait MetadataBuilder: Sized {
    fn base_mut(&mut self) -> &mut BaseMetadata;

    fn workspace_id(mut self, workspace_id: impl AsRef<str>) -> Self {
        self.base_mut().workspace_id = strip(workspace_id.as_ref());
        self
    }

    fn workspace_name(mut self, workspace_name: impl AsRef<str>) -> Self {
        self.base_mut().workspace_name = strip(workspace_name.as_ref());
        self
    }
}

/// Builder for request events.
///
/// # Example
///
/// ```
/// use log_analytics_forwarder::metadata::{MetadataBuilder, RequestMetadata};
///
/// let event = RequestMetadata::new()
///     .workspace_id("a1b2")
///     .user_agent("python-requests/2.24.0")
///     .duration_sec(3)
///     .build();
/// assert_eq!(event.log_type(), "CustomLogRequestMetadata");
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    base: BaseMetadata,
    fields: RequestFields,
}

impl RequestMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the raw user agent; the short form is derived from it.
    pub fn user_agent(mut self, user_agent: impl AsRef<str>) -> Self {
        self.fields.user_agent = strip(user_agent.as_ref());
        self.fields.user_agent_short = normalize_user_agent(self.fields.user_agent.as_deref());
        self
    }

    pub fn duration_sec(mut self, duration_sec: u32) -> Self {
        self.fields.duration_sec = duration_sec;
        self
    }

    pub fn build(self) -> Event {
        Event::new(self.base, EventKind::Request(self.fields))
    }
}

impl MetadataBuilder for RequestMetadata {
    fn base_mut(&mut self) -> &mut BaseMetadata {
        &mut self.base
    }
}

/// Builder for periodic statistic events.
#[derive(Debug, Clone, Default)]
pub struct StatisticMetadata {
    base: BaseMetadata,
    fields: StatisticFields,
}

impl StatisticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(mut self, object_count: u64) -> Self {
        self.fields.object_count = object_count;
        self
    }

    pub fn build(self) -> Event {
        Event::new(self.base, EventKind::Statistic(self.fields))
    }
}

impl MetadataBuilder for StatisticMetadata {
    fn base_mut(&mut self) -> &mut BaseMetadata {
        &mut self.base
    }
}

/// Builder for events with a caller-defined log type and field set.
#[derive(Debug, Clone)]
pub struct CustomMetadata {
    base: BaseMetadata,
    log_type: String,
    fields: Map<String, Value>,
}

impl CustomMetadata {
    pub fn new(log_type: impl Into<String>) -> Self {
        Self {
            base: BaseMetadata::default(),
            log_type: log_type.into(),
            fields: Map::new(),
        }
    }

    /// Add a field. Null values and blank strings are left out.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = match value.into() {
            Value::Null => None,
            Value::String(s) => strip(&s).map(Value::String),
            other => Some(other),
        };
        let name = name.into();
        match value {
            Some(value) => {
                self.fields.insert(name, value);
            }
            None => {
                self.fields.remove(&name);
            }
        }
        self
    }

    /// Validate the log type and field names and stamp the event.
    pub fn build(self) -> Result<Event, MetadataError> {
        let valid_log_type = !self.log_type.is_empty()
            && self.log_type.len() <= MAX_LOG_TYPE_LEN
            && self
                .log_type
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_log_type {
            return Err(MetadataError::InvalidLogType(self.log_type));
        }

        if let Some(reserved) = self
            .fields
            .keys()
            .find(|name| RESERVED_FIELDS.contains(&name.as_str()))
        {
            return Err(MetadataError::ReservedField(reserved.clone()));
        }

        Ok(Event::new(
            self.base,
            EventKind::Custom(CustomFields {
                log_type: self.log_type,
                fields: self.fields,
            }),
        ))
    }
}

impl MetadataBuilder for CustomMetadata {
    fn base_mut(&mut self) -> &mut BaseMetadata {
        &mut self.base
    }
}

/// Reduce a user agent to its product name.
///
/// Drops everything from the first `" ("` and then from the first `/`,
/// collapses whitespace runs and trims. Returns `None` when nothing is left.
pub fn normalize_user_agent(user_agent: Option<&str>) -> Option<String> {
    let mut ua = user_agent?.trim();
    if let Some(idx) = ua.find(" (") {
        ua = &ua[..idx];
    }
    if let Some(idx) = ua.find('/') {
        ua = &ua[..idx];
    }
    let normalized = ua.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}
