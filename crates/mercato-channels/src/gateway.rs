use async_trait::async_trait;

use crate::error::GatewayError;
use crate::types::{OutboundPayload, SendReceipt};

/// Outbound transport to the messaging channel. The core never encodes the
/// channel wire format itself; implementations live outside the core.
///
/// Implementations must be `Send + Sync` so a single gateway can be shared
/// across the orchestrator and the scheduler pool.
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    /// Deliver one payload to `to` using the given tenant credentials.
    async fn send(
        &self,
        tenant_credentials: &serde_json::Value,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<SendReceipt, GatewayError>;
}
