use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatfront_common::GatewayResult;
use chatfront_pipeline::{Handler, Middleware, Next, Packet, PacketContext};
use tracing::{debug, info, warn};

use crate::packets::{Hello, JoinRoom, Outbound, Ping, SendMessage};
use crate::session::SessionRegistry;

async fn reply(ctx: &PacketContext, frame: Outbound) -> GatewayResult<()> {
    ctx.client().send(Arc::new(frame)).await
}

pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, ctx: &PacketContext, packet: Arc<dyn Packet>) -> GatewayResult<()> {
        let nonce = packet.downcast_ref::<Ping>().and_then(|ping| ping.nonce);
        reply(ctx, Outbound::Pong { nonce }).await
    }
}

pub struct HelloHandler {
    sessions: Arc<SessionRegistry>,
}

impl HelloHandler {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Handler for HelloHandler {
    async fn handle(&self, ctx: &PacketContext, packet: Arc<dyn Packet>) -> GatewayResult<()> {
        let Some(hello) = packet.downcast_ref::<Hello>() else {
            return Ok(());
        };

        let client_id = ctx.client().id().to_string();
        let name = hello.name.trim();
        if name.is_empty() {
            return reply(ctx, Outbound::error("name must not be empty")).await;
        }

        self.sessions.set_name(&client_id, name);
        info!(client = %client_id, name, "client introduced itself");
        reply(
            ctx,
            Outbound::Welcome {
                client_id,
                name: name.to_string(),
            },
        )
        .await
    }
}

pub struct JoinRoomHandler {
    sessions: Arc<SessionRegistry>,
}

impl JoinRoomHandler {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Handler for JoinRoomHandler {
    async fn handle(&self, ctx: &PacketContext, packet: Arc<dyn Packet>) -> GatewayResult<()> {
        let Some(join) = packet.downcast_ref::<JoinRoom>() else {
            return Ok(());
        };

        let members = self.sessions.join(&join.room, ctx.client().id());
        let last_message = self.sessions.last_message(&join.room)?.map(Box::new);
        debug!(client = %ctx.client().id(), room = %join.room, members, "joined room");

        reply(
            ctx,
            Outbound::Joined {
                room: join.room.clone(),
                members,
                last_message,
            },
        )
        .await
    }
}

/// Longest a broadcast waits on one member's outbound queue.
const MEMBER_SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// Broadcasts a message to every member of its room, sender included.
///
/// A member whose queue stays full for [`MEMBER_SEND_TIMEOUT`] misses the
/// message; the sender's dispatch never waits on it longer than that.
pub struct SendMessageHandler {
    sessions: Arc<SessionRegistry>,
}

impl SendMessageHandler {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Handler for SendMessageHandler {
    async fn handle(&self, ctx: &PacketContext, packet: Arc<dyn Packet>) -> GatewayResult<()> {
        let Some(message) = packet.downcast_ref::<SendMessage>() else {
            return Ok(());
        };

        let frame = Outbound::Message {
            room: message.room.clone(),
            from: self.sessions.display_name(ctx.client().id()),
            text: message.text.clone(),
            sent_at: chrono::Utc::now().to_rfc3339(),
        };
        self.sessions.remember_message(&message.room, frame.clone())?;

        let frame: Arc<dyn Packet> = Arc::new(frame);
        for member in self.sessions.members(&message.room) {
            ctx.ensure_not_cancelled()?;
            match tokio::time::timeout(MEMBER_SEND_TIMEOUT, member.send(frame.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(client = %member.id(), error = %e, "broadcast delivery failed");
                }
                Err(_) => {
                    warn!(client = %member.id(), room = %message.room, "member queue full, message dropped");
                }
            }
        }
        Ok(())
    }
}

/// Drops room messages from clients that have not joined the room.
pub struct RoomMembershipGuard {
    sessions: Arc<SessionRegistry>,
}

impl RoomMembershipGuard {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Middleware for RoomMembershipGuard {
    async fn invoke(
        &self,
        ctx: &PacketContext,
        packet: Arc<dyn Packet>,
        next: Next<'_>,
    ) -> GatewayResult<()> {
        if let Some(message) = packet.downcast_ref::<SendMessage>() {
            if !self.sessions.is_member(&message.room, ctx.client().id()) {
                debug!(client = %ctx.client().id(), room = %message.room, "message to unjoined room");
                let notice = format!("join room '{}' before sending to it", message.room);
                return reply(ctx, Outbound::error(notice)).await;
            }
        }

        next.run(ctx, packet).await
    }
}
