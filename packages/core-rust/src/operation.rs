//! The operation model: one logical GraphQL request flowing down the pipeline.

use std::fmt;
use std::str::FromStr;

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wire::ExecutionArgs;

// ---------------------------------------------------------------------------
// OperationId
// ---------------------------------------------------------------------------

/// Opaque identity of a logical request.
///
/// Two operations are the same logical operation iff their ids are equal.
/// The id is assigned once and survives `with_kind` / `with_policy` copies,
/// which is how re-executions and teardowns find their original request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh id that no other request will share.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// A stable id derived from the document, operation name and variables.
    ///
    /// Identical documents selecting the same operation with equal variables
    /// always map to the same id, so they share one cache entry and one
    /// active result source. Variables are hashed in canonical (key-sorted)
    /// JSON form.
    #[must_use]
    pub fn from_args(args: &ExecutionArgs) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(args.query.as_bytes());
        hasher.update(&[0]);
        if let Some(name) = &args.operation_name {
            hasher.update(&[1]);
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
        }
        if let Some(variables) = &args.variables {
            hash_canonical(&mut hasher, variables);
        }
        let digest = hasher.finalize();
        Self(hex::encode(&digest.as_bytes()[..16]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Feeds `value` to the hasher with object keys in sorted order, independent
/// of how the map preserves insertion order.
fn hash_canonical(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(Value::String(key.clone()).to_string().as_bytes());
                hasher.update(b":");
                hash_canonical(hasher, &map[key.as_str()]);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_canonical(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => {
            hasher.update(scalar.to_string().as_bytes());
        }
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What an operation asks the pipeline to do.
///
/// `Teardown` is not a GraphQL operation: it is the control signal telling
/// every exchange to release whatever it holds for the operation's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
    Teardown,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
            Self::Teardown => "teardown",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a query interacts with the document cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestPolicy {
    /// Serve from cache when present, otherwise fetch.
    #[default]
    CacheFirst,
    /// Serve from cache only; never fetch.
    CacheOnly,
    /// Always fetch; never read the cache.
    NetworkOnly,
    /// Serve the cached value marked stale, and fetch a fresh one.
    CacheAndNetwork,
}

impl RequestPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::CacheOnly => "cache-only",
            Self::NetworkOnly => "network-only",
            Self::CacheAndNetwork => "cache-and-network",
        }
    }
}

impl fmt::Display for RequestPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown request policy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown request policy: {0} (expected cache-first, cache-only, network-only or cache-and-network)")]
pub struct ParsePolicyError(String);

impl FromStr for RequestPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache-first" => Ok(Self::CacheFirst),
            "cache-only" => Ok(Self::CacheOnly),
            "network-only" => Ok(Self::NetworkOnly),
            "cache-and-network" => Ok(Self::CacheAndNetwork),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// RequestTarget
// ---------------------------------------------------------------------------

/// Where a transport should send an operation.
///
/// Exchanges may rewrite it on the way down, e.g. to inject auth headers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestTarget {
    pub url: String,
    pub headers: HeaderMap,
}

impl RequestTarget {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// One logical request travelling down the exchange chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub request: RequestTarget,
    pub policy: RequestPolicy,
    /// GraphQL type names appearing in the selection, used only to index the
    /// cache for invalidation.
    pub types: Vec<String>,
    pub args: ExecutionArgs,
}

impl Operation {
    /// Creates an operation keyed for its kind.
    ///
    /// Queries and subscriptions get an id derived from their arguments.
    /// Every mutation gets a fresh id, so two identical mutations stay two
    /// requests with two results.
    #[must_use]
    pub fn new(kind: OperationKind, args: ExecutionArgs, request: RequestTarget) -> Self {
        let id = match kind {
            OperationKind::Mutation => OperationId::random(),
            _ => OperationId::from_args(&args),
        };
        Self {
            id,
            kind,
            request,
            policy: RequestPolicy::default(),
            types: Vec::new(),
            args,
        }
    }

    #[must_use]
    pub fn query(args: ExecutionArgs, request: RequestTarget) -> Self {
        Self::new(OperationKind::Query, args, request)
    }

    #[must_use]
    pub fn mutation(args: ExecutionArgs, request: RequestTarget) -> Self {
        Self::new(OperationKind::Mutation, args, request)
    }

    #[must_use]
    pub fn subscription(args: ExecutionArgs, request: RequestTarget) -> Self {
        Self::new(OperationKind::Subscription, args, request)
    }

    /// Copy of this operation with a different kind and the same id.
    #[must_use]
    pub fn with_kind(&self, kind: OperationKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    /// Copy of this operation with a different policy and the same id.
    #[must_use]
    pub fn with_policy(&self, policy: RequestPolicy) -> Self {
        Self {
            policy,
            ..self.clone()
        }
    }

    /// The teardown signal for this operation.
    #[must_use]
    pub fn teardown(&self) -> Self {
        self.with_kind(OperationKind::Teardown)
    }

    #[must_use]
    pub fn with_id(mut self, id: OperationId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_request(mut self, request: RequestTarget) -> Self {
        self.request = request;
        self
    }

    #[must_use]
    pub fn is_teardown(&self) -> bool {
        self.kind == OperationKind::Teardown
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
