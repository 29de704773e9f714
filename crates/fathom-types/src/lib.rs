//! Shared data model for the Fathom UDF runtime.
//!
//! These types cross crate boundaries (configuration source, engine, state
//! sink) and, in their JSON form, the sandbox boundary. Guest-facing JSON uses
//! camelCase field names.

pub mod function;
pub mod invocation;
pub mod state;

pub use function::{FunctionConfig, PipelineBundle, PipelineSpec};
pub use invocation::{Event, InvocationContext, ProfileResult, ProfileUser};
pub use state::{StateKey, StateRecord};

/// Timestamp type used throughout.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Current UTC time.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}
