//! In-memory link pairs for tests
//!
//! Two `Link`s joined back to back: streams opened on one side pop out of
//! `accept_stream` on the other, carried by in-process duplex pipes. Lets
//! whole agents be wired together without sockets or TLS.

use crate::transport::{BoxLink, BoxStream, Link};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

pub fn link_pair() -> (BoxLink, BoxLink) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        Box::new(MemoryLink {
            to_remote: Mutex::new(Some(a_tx)),
            from_remote: AsyncMutex::new(b_rx),
        }),
        Box::new(MemoryLink {
            to_remote: Mutex::new(Some(b_tx)),
            from_remote: AsyncMutex::new(a_rx),
        }),
    )
}

struct MemoryLink {
    to_remote: Mutex<Option<mpsc::UnboundedSender<BoxStream>>>,
    from_remote: AsyncMutex<mpsc::UnboundedReceiver<BoxStream>>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn open_stream(&self) -> Result<BoxStream> {
        let (mine, theirs) = tokio::io::duplex(256 * 1024);
        let sender = self
            .to_remote
            .lock()
            .expect("memory link lock")
            .clone()
            .ok_or_else(|| anyhow!("memory link closed"))?;
        sender
            .send(Box::new(theirs))
            .map_err(|_| anyhow!("memory link peer gone"))?;
        Ok(Box::new(mine))
    }

    async fn accept_stream(&self) -> Result<BoxStream> {
        self.from_remote
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow!("memory link closed"))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) {
        self.to_remote.lock().expect("memory link lock").take();
    }
}
