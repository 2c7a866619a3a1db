pub mod builder;
pub mod error;
pub mod rag;
pub mod suggestions;
pub mod types;

pub use builder::ContextBuilder;
pub use error::{ContextError, Result};
pub use types::AgentContext;
