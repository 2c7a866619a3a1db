pub mod error;
pub mod gateway;
pub mod types;

pub use error::GatewayError;
pub use gateway::ChannelGateway;
pub use types::{ListRow, ListSection, OutboundPayload, SendReceipt};
