// ABOUTME: Shared runtime types for the hatch task worker
// ABOUTME: Task identity and log, payload schemas, reference-counted resource cache, one-shot resolution

pub mod cache;
pub mod error;
pub mod resolver;
pub mod schema;
pub mod task;

pub use cache::{CacheStats, Fetcher, ResourceCache, ResourceHandle};
pub use error::{MalformedPayloadError, ResourceError, SchemaConflict};
pub use resolver::Resolver;
pub use schema::PayloadSchema;
pub use task::{ExceptionReason, LogError, TaskContext, TaskInfo, TaskOutcome};
