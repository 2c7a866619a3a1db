pub mod db;
pub mod recorder;
pub mod types;

pub use recorder::UsageRecorder;
pub use types::{AgentInteraction, ProviderUsage, ReplyShape};
