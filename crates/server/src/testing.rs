//! Test doubles shared by the server's unit tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chatfront_common::{GatewayError, GatewayResult};
use chatfront_pipeline::{Client, Packet};

use crate::packets::Outbound;

pub type Sent = Arc<Mutex<Vec<Outbound>>>;

/// A client that records every frame sent to it.
pub struct RecordingClient {
    id: String,
    sent: Sent,
}

impl RecordingClient {
    pub fn new(id: &str) -> (Arc<Self>, Sent) {
        let sent = Sent::default();
        let client = Arc::new(Self {
            id: id.to_string(),
            sent: sent.clone(),
        });
        (client, sent)
    }
}

#[async_trait]
impl Client for RecordingClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn peer_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    async fn send(&self, packet: Arc<dyn Packet>) -> GatewayResult<()> {
        let frame = packet
            .downcast_ref::<Outbound>()
            .ok_or_else(|| GatewayError::Transport("not an outbound frame".into()))?;
        self.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }
}
