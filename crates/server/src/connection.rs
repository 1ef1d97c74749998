use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chatfront_common::{GatewayError, GatewayResult};
use chatfront_pipeline::{Client, Packet, PacketContext, Router};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::ChatMetrics;
use crate::packets::{decode_frame, Outbound};
use crate::session::SessionRegistry;

/// How long a closing connection may spend flushing queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One connected TCP client.
///
/// Outbound frames go through a bounded queue drained by a dedicated writer
/// task, so a slow reader applies backpressure to whoever sends to it.
pub struct Connection {
    id: String,
    peer: SocketAddr,
    outbound: mpsc::Sender<String>,
}

impl Connection {
    pub fn new(peer: SocketAddr, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer,
            outbound,
        }
    }
}

#[async_trait]
impl Client for Connection {
    fn id(&self) -> &str {
        &self.id
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn send(&self, packet: Arc<dyn Packet>) -> GatewayResult<()> {
        let frame = packet.downcast_ref::<Outbound>().ok_or_else(|| {
            GatewayError::Transport(format!("cannot send packet of kind {}", packet.kind()))
        })?;
        let line = frame.encode()?;

        self.outbound
            .send(line)
            .await
            .map_err(|_| GatewayError::Transport("connection closed".into()))
    }
}

/// Everything a connection task needs from the server.
#[derive(Clone)]
pub struct ConnectionServices {
    pub router: Arc<Router>,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Arc<ChatMetrics>,
    pub outbound_queue: usize,
    pub max_frame_bytes: usize,
}

/// Serve one client until it disconnects or `shutdown` fires.
///
/// Frames are dispatched one at a time in arrival order. Each dispatch gets a
/// child of `shutdown` as its cancellation token.
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    services: ConnectionServices,
    shutdown: CancellationToken,
) -> GatewayResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<String>(services.outbound_queue);

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &line).await {
                debug!(error = %e, "writer stopped");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let connection = Arc::new(Connection::new(peer, tx));
    let client: Arc<dyn Client> = connection.clone();
    services.sessions.register(client.clone());
    services.metrics.connections_total.inc();
    services.metrics.connections_active.inc();
    info!(client = %connection.id, peer = %peer, "client connected");

    let result = read_loop(read_half, &client, &services, &shutdown).await;

    services.sessions.remove(&connection.id);
    services.metrics.connections_active.dec();
    info!(client = %connection.id, peer = %peer, "client disconnected");

    drop(client);
    drop(connection);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!(peer = %peer, "timed out flushing outbound frames");
    }

    result
}

async fn read_loop(
    read_half: tokio::net::tcp::OwnedReadHalf,
    client: &Arc<dyn Client>,
    services: &ConnectionServices,
    shutdown: &CancellationToken,
) -> GatewayResult<()> {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let limit = services.max_frame_bytes as u64 + 1;

    loop {
        line.clear();
        let mut limited = (&mut reader).take(limit);
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            read = limited.read_line(&mut line) => read?,
        };

        if read == 0 {
            return Ok(());
        }
        if !line.ends_with('\n') && read as u64 >= limit {
            let notice = format!("frame exceeds {} bytes", services.max_frame_bytes);
            client.send(Arc::new(Outbound::error(notice))).await?;
            return Err(GatewayError::Transport("oversized frame".into()));
        }

        let frame = line.trim();
        if frame.is_empty() {
            continue;
        }

        let packet = match decode_frame(frame) {
            Ok(packet) => packet,
            Err(e) => {
                services.metrics.decode_errors.inc();
                debug!(client = %client.id(), error = %e, "undecodable frame");
                client
                    .send(Arc::new(Outbound::error(format!("invalid frame: {e}"))))
                    .await?;
                continue;
            }
        };

        dispatch(client, services, shutdown, packet).await?;
    }
}

async fn dispatch(
    client: &Arc<dyn Client>,
    services: &ConnectionServices,
    shutdown: &CancellationToken,
    packet: Arc<dyn Packet>,
) -> GatewayResult<()> {
    let kind = packet.kind();
    let ctx = PacketContext::new(client.clone(), shutdown.child_token());

    let started = Instant::now();
    let result = services.router.execute(&ctx, packet).await;
    services
        .metrics
        .dispatch_duration
        .observe(started.elapsed().as_secs_f64());
    services
        .metrics
        .packets_total
        .with_label_values(&[kind.name()])
        .inc();

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            services.metrics.dispatch_errors.inc();
            warn!(client = %client.id(), kind = %kind, error = %e, "dispatch failed");
            client
                .send(Arc::new(Outbound::error(e.to_string())))
                .await
        }
    }
}

async fn write_frame(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    line: &str,
) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
