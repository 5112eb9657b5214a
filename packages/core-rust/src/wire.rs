//! GraphQL-over-HTTP and GraphQL-over-WebSocket payload shapes.
//!
//! These structs are the exact JSON bodies exchanged with a GraphQL server.
//! All structs use `#[serde(rename_all = "camelCase")]` so that
//! `operation_name` serializes as `operationName` and `has_next` as `hasNext`.
//! Optional members are skipped when absent rather than serialized as `null`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Request body
// ---------------------------------------------------------------------------

/// Execution arguments of one GraphQL request.
///
/// Serializes to `{ query, operationName?, variables?, extensions? }`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionArgs {
    /// The GraphQL document text.
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation_name: Option<String>,
    /// Variables object. Kept as a raw JSON value; the selection layer owns typing.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub variables: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extensions: Option<Value>,
}

impl ExecutionArgs {
    /// Creates arguments carrying only a document.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_extensions(mut self, extensions: Value) -> Self {
        self.extensions = Some(extensions);
        self
    }
}

// ---------------------------------------------------------------------------
// Response body
// ---------------------------------------------------------------------------

/// A GraphQL execution result as returned by the server.
///
/// Serializes to `{ data?, errors?, hasNext?, extensions? }`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub errors: Option<Vec<GraphqlError>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub has_next: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extensions: Option<Value>,
}

impl ExecutionResult {
    /// Returns the server errors, treating an empty `errors` array as no errors.
    #[must_use]
    pub fn graphql_errors(&self) -> Option<&[GraphqlError]> {
        match self.errors.as_deref() {
            Some(errors) if !errors.is_empty() => Some(errors),
            _ => None,
        }
    }
}

/// Location of a GraphQL error in the request document (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphqlErrorLocation {
    pub line: u32,
    pub column: u32,
}

/// One segment of a GraphQL error path: a field name or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GraphqlPathSegment {
    Key(String),
    Index(i64),
}

/// A protocol-level error reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphqlError {
    /// Human-readable error message.
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<GraphqlErrorLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<GraphqlPathSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphqlError {
    /// Creates an error with only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: Vec::new(),
            extensions: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
