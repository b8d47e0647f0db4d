//! TCP relay between game clients and the backend server, with an injector on every link.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use mc_intercept_core::{ConnectionInfo, ConnectionInjector, FrameTransport, InterceptError, ProtocolManager};
use mc_intercept_proto::frame::split_frame;
use mc_intercept_proto::Uuid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8192;

/// Hands frames to the client writer task.
struct ChannelTransport {
    tx: UnboundedSender<Bytes>,
}

impl FrameTransport for ChannelTransport {
    fn write_frame(&self, frame: Bytes) -> Result<(), InterceptError> {
        self.tx
            .send(frame)
            .map_err(|_| InterceptError::Transport("client writer closed".into()))
    }
}

/// Relay one client until either side closes.
pub async fn handle_client(
    client: TcpStream,
    addr: SocketAddr,
    backend: String,
    max_frame: usize,
    manager: Arc<ProtocolManager>,
) {
    let server = match TcpStream::connect(&backend).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Backend {backend} unreachable for {addr}: {e}");
            return;
        }
    };
    let _ = client.set_nodelay(true);
    let _ = server.set_nodelay(true);

    let (tx, mut rx) = unbounded_channel::<Bytes>();
    let info = ConnectionInfo::new(Uuid::random(), "unknown").with_address(addr);
    let id = info.id;
    let injector = match manager.on_connect(info, Arc::new(ChannelTransport { tx })) {
        Ok(i) => i,
        Err(e) => {
            warn!("Could not intercept {addr}: {e}");
            return;
        }
    };

    let (client_read, mut client_write) = client.into_split();
    let (server_read, server_write) = server.into_split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if client_write.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let result = tokio::select! {
        r = client_to_server(client_read, server_write, &injector, max_frame) => r,
        r = server_to_client(server_read, &injector, max_frame) => r,
    };
    match result {
        Ok(()) => debug!("{addr} closed"),
        Err(e) => info!("{addr} dropped: {e}"),
    }

    manager.on_disconnect(id);
    drop(injector);
    writer.abort();
}

async fn client_to_server(
    mut client: OwnedReadHalf,
    mut server: OwnedWriteHalf,
    injector: &ConnectionInjector,
    max_frame: usize,
) -> Result<(), InterceptError> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        if client.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
        while let Some(body) = split_frame(&mut buf, max_frame)? {
            if let Some(frame) = injector.receive_frame(body)? {
                server.write_all(&frame).await?;
            }
        }
    }
}

async fn server_to_client(
    mut server: OwnedReadHalf,
    injector: &ConnectionInjector,
    max_frame: usize,
) -> Result<(), InterceptError> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        if server.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
        while let Some(body) = split_frame(&mut buf, max_frame)? {
            injector.relay_outbound(body)?;
        }
    }
}
