//! Accept loop for client connections

use crate::common::net::configure_tcp_stream;
use crate::connection::client::ClientSide;
use crate::connection::ProxyContext;
use crate::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Listens for client connections and hands each socket to a
/// [`ClientSide`].
pub struct ProxyListener {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    running: AtomicBool,
}

impl ProxyListener {
    pub async fn bind(ctx: Arc<ProxyContext>) -> Result<Self> {
        let listener = TcpListener::bind(&ctx.config.listen).await?;
        Ok(ProxyListener {
            listener,
            ctx,
            running: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(&self) -> Result<()> {
        let addr = self.local_addr()?;
        info!("HTTP proxy listening on {}", addr);
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    configure_tcp_stream(&stream);
                    ClientSide::spawn(stream, peer_addr, self.ctx.clone());
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
