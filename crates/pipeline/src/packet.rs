use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chatfront_common::{GatewayError, GatewayResult};
use tokio_util::sync::CancellationToken;

use crate::kind::{PacketKind, PacketType};

/// A decoded packet value whose kind is known at dispatch time.
///
/// Implemented automatically for every `PacketType` that is also
/// `Debug + Send + Sync + 'static`.
pub trait Packet: Any + Send + Sync + fmt::Debug {
    fn kind(&self) -> PacketKind;

    fn as_any(&self) -> &dyn Any;
}

impl<T> Packet for T
where
    T: PacketType + Any + Send + Sync + fmt::Debug,
{
    fn kind(&self) -> PacketKind {
        T::KIND
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Packet {
    pub fn downcast_ref<T: Packet>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Packet>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// The connection a packet arrived on.
#[async_trait]
pub trait Client: Send + Sync {
    /// Stable identity of the client, used as the default rate-limit partition.
    fn id(&self) -> &str;

    fn peer_addr(&self) -> SocketAddr;

    /// Queue a packet for delivery to this client.
    async fn send(&self, packet: Arc<dyn Packet>) -> GatewayResult<()>;
}

/// Per-dispatch context handed to every middleware and handler.
#[derive(Clone)]
pub struct PacketContext {
    client: Arc<dyn Client>,
    cancellation: CancellationToken,
}

impl PacketContext {
    pub fn new(client: Arc<dyn Client>, cancellation: CancellationToken) -> Self {
        Self {
            client,
            cancellation,
        }
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Fail with [`GatewayError::Cancelled`] once the dispatch was cancelled.
    pub fn ensure_not_cancelled(&self) -> GatewayResult<()> {
        if self.is_cancelled() {
            Err(GatewayError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for PacketContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketContext")
            .field("client", &self.client.id())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
