//! RPC Endpoint
//!
//! Local TCP listener serving the `Register` method. Each accepted
//! connection gets its own writer task and router task.

use crate::plugin::error::{HostError, HostResult};
use crate::plugin::manager::HostShared;
use crate::plugin::router;
use crate::protocol::{spawn_writer, FrameReader, ServerMessage, StreamHeader};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Time a new connection has to send its stream header
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RpcEndpoint {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RpcEndpoint {
    /// Bind on loopback; port 0 picks an ephemeral port
    pub async fn bind(port: u16) -> HostResult<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| HostError::io(format!("binding plugin server on port {port}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| HostError::io("reading plugin server address", e))?;
        log::debug!("RpcEndpoint: listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` turns true
    pub(crate) fn spawn(
        self,
        shared: Arc<HostShared>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(handle_connection(stream, peer, shared.clone()));
                        }
                        Err(e) => {
                            log::warn!("RpcEndpoint: accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    },
                }
            }
            log::debug!("RpcEndpoint: stopped accepting on {}", self.local_addr);
        })
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<HostShared>) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    match tokio::time::timeout(HEADER_TIMEOUT, reader.recv::<StreamHeader>()).await {
        Ok(Ok(Some(header))) => {
            if let Err(e) = header.validate() {
                log::warn!("RpcEndpoint: rejecting {}: {}", peer, e);
                return;
            }
        }
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            log::warn!("RpcEndpoint: bad stream header from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            log::warn!("RpcEndpoint: {} sent no stream header", peer);
            return;
        }
    }

    let (sender, writer) = spawn_writer::<ServerMessage, _>(write_half);
    router::serve_stream(shared, reader, sender.clone(), peer.to_string()).await;
    sender.close();
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_disconnect() => {}
        Ok(Err(e)) => log::debug!("RpcEndpoint: writer for {} failed: {}", peer, e),
        Err(e) => log::debug!("RpcEndpoint: writer task for {} aborted: {}", peer, e),
    }
}
