//! `Switchboard` Core: GraphQL operations, results, combined errors, and wire payloads.
//!
//! This crate has no runtime or transport: it is the data model shared by the
//! exchange pipeline in `switchboard-client` and anything that builds
//! operations for it.

pub mod error;
pub mod operation;
pub mod result;
pub mod wire;

pub use error::{CombinedError, TransportError};
pub use operation::{
    Operation, OperationId, OperationKind, ParsePolicyError, RequestPolicy, RequestTarget,
};
pub use result::OperationResult;
pub use wire::{
    ExecutionArgs, ExecutionResult, GraphqlError, GraphqlErrorLocation, GraphqlPathSegment,
};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
