//! TCP command server - one task per connection, newline-delimited JSON
//!
//! Each line is one request and gets exactly one response line, in order. A
//! client that disconnects mid-flow leaves its intents to expire on their own.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::core::Result;
use crate::engine::Dispatcher;

pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    pub async fn bind(addr: &str, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, dispatcher })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips. Open sessions finish on their own.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("🔌 accepting commands on {}", self.local_addr()?);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let span = info_span!("session", id = %Uuid::new_v4(), %peer);
                        tokio::spawn(
                            async move {
                                if let Err(e) = serve(stream, dispatcher).await {
                                    warn!("session ended with error: {}", e);
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("command server stopped accepting");
        Ok(())
    }
}

async fn serve(stream: TcpStream, dispatcher: Arc<Dispatcher>) -> Result<()> {
    debug!("session opened");
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatcher.handle_line(&line).await;
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write_half.write_all(&out).await?;
    }
    debug!("session closed");
    Ok(())
}
