//! HTTP/2 transport
//!
//! One TCP+TLS connection per peer, stream-multiplexed at the HTTP/2 layer.
//! Every mesh stream is a CONNECT-style POST to a fixed URL path; the
//! accepting agent answers 200 and the request/response bodies become the
//! two directions of the pipe. HTTP/2 flow control applies per stream, which
//! is exactly the per-stream backpressure the stream engine relies on.
//!
//! HTTP/2 gives the server no way to initiate a request stream, so
//! `open_stream` only works on the dialling side; the peer layer never calls
//! it on an accepted link.

use super::tls;
use crate::config::{ListenerConfig, PeerConfig};
use crate::transport::{resolve, split_host_port, Acceptor, BoxAcceptor, BoxLink, BoxStream, Link};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use h2::{RecvStream, SendStream};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Dial a peer over HTTP/2.
pub async fn dial(peer: &PeerConfig) -> Result<BoxLink> {
    let (host, _) = split_host_port(&peer.address)?;
    let remote = resolve(&peer.address).await?;

    let mut crypto = tls::client_config(&peer.tls)?;
    crypto.alpn_protocols = vec![b"h2".to_vec()];

    let tcp = TcpStream::connect(remote)
        .await
        .with_context(|| format!("TCP connect to {}", remote))?;
    tcp.set_nodelay(true).ok();
    let local_addr = tcp.local_addr().ok();

    let connector = TlsConnector::from(Arc::new(crypto));
    let tls_stream = connector
        .connect(tls::server_name(&peer.tls, &host)?, tcp)
        .await
        .with_context(|| format!("TLS handshake with {}", remote))?;

    let (send_request, connection) = h2::client::handshake(tls_stream)
        .await
        .context("h2 handshake")?;
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::debug!("[h2] connection driver ended: {}", e);
        }
    });

    log::debug!("[h2] connected to {}", remote);
    Ok(Box::new(H2ClientLink {
        send_request: Mutex::new(send_request),
        authority: host,
        path: "/mesh".to_string(),
        local_addr,
        remote_addr: Some(remote),
        driver,
    }))
}

/// Bind an HTTP/2 listener.
pub async fn listen(listener: &ListenerConfig) -> Result<BoxAcceptor> {
    let mut crypto = tls::server_config(listener)?;
    crypto.alpn_protocols = vec![b"h2".to_vec()];

    let tcp = TcpListener::bind(listener.bind)
        .await
        .with_context(|| format!("binding h2 listener on {}", listener.bind))?;
    log::info!("[h2] listening on {}", listener.bind);
    Ok(Box::new(H2Acceptor {
        tcp,
        tls: TlsAcceptor::from(Arc::new(crypto)),
        path: listener.path.clone(),
    }))
}

struct H2ClientLink {
    send_request: Mutex<h2::client::SendRequest<Bytes>>,
    authority: String,
    path: String,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    driver: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl Link for H2ClientLink {
    async fn open_stream(&self) -> Result<BoxStream> {
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(format!("https://{}{}", self.authority, self.path))
            .body(())
            .expect("static request");

        let (response, send) = {
            let sender = self.send_request.lock().await.clone();
            let mut sender = sender.ready().await.context("h2 not ready")?;
            sender.send_request(request, false).context("h2 send_request")?
        };
        let response = response.await.context("h2 stream response")?;
        if response.status() != http::StatusCode::OK {
            return Err(anyhow!("mesh endpoint answered {}", response.status()));
        }
        let recv = response.into_body();
        Ok(Box::new(H2Io::new(send, recv)))
    }

    async fn accept_stream(&self) -> Result<BoxStream> {
        // The server half of h2 cannot push mesh streams; the dialler opens
        // every substream on this link.
        futures::future::pending::<()>().await;
        unreachable!()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    async fn close(&self) {
        self.driver.abort();
    }
}

type ServerConn = h2::server::Connection<tokio_rustls::server::TlsStream<TcpStream>, Bytes>;

struct H2ServerLink {
    conn: Mutex<ServerConn>,
    path: String,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

#[async_trait]
impl Link for H2ServerLink {
    async fn open_stream(&self) -> Result<BoxStream> {
        Err(anyhow!("h2 server side cannot open streams"))
    }

    async fn accept_stream(&self) -> Result<BoxStream> {
        let mut conn = self.conn.lock().await;
        loop {
            let (request, mut respond) = match conn.accept().await {
                Some(next) => next.context("h2 accept")?,
                None => return Err(anyhow!("h2 connection closed")),
            };
            if request.uri().path() != self.path {
                log::debug!("[h2] rejecting stream for unknown path {}", request.uri().path());
                let not_found = http::Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(())
                    .expect("static response");
                respond.send_response(not_found, true).ok();
                continue;
            }
            let ok = http::Response::builder()
                .status(http::StatusCode::OK)
                .body(())
                .expect("static response");
            let send = respond.send_response(ok, false).context("h2 respond")?;
            let recv = request.into_body();
            return Ok(Box::new(H2Io::new(send, recv)));
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    async fn close(&self) {
        let mut conn = self.conn.lock().await;
        conn.abrupt_shutdown(h2::Reason::NO_ERROR);
    }
}

struct H2Acceptor {
    tcp: TcpListener,
    tls: TlsAcceptor,
    path: String,
}

#[async_trait]
impl Acceptor for H2Acceptor {
    async fn accept(&mut self) -> Result<BoxLink> {
        let (stream, remote) = self.tcp.accept().await.context("TCP accept")?;
        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr().ok();
        let tls_stream = self
            .tls
            .accept(stream)
            .await
            .with_context(|| format!("TLS handshake with {}", remote))?;
        let conn = h2::server::handshake(tls_stream).await.context("h2 handshake")?;
        log::debug!("[h2] accepted connection from {}", remote);
        Ok(Box::new(H2ServerLink {
            conn: Mutex::new(conn),
            path: self.path.clone(),
            local_addr,
            remote_addr: Some(remote),
        }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr().ok()
    }
}

/// Adapts an h2 send/recv stream pair to `AsyncRead + AsyncWrite`.
struct H2Io {
    send: SendStream<Bytes>,
    recv: RecvStream,
    /// Data received but not yet handed to the reader. Flow-control capacity
    /// is released only as bytes are consumed.
    pending: Bytes,
}

impl H2Io {
    fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        Self { send, recv, pending: Bytes::new() }
    }

    fn copy_pending(&mut self, buf: &mut ReadBuf<'_>) -> usize {
        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending.split_to(n));
        if n > 0 {
            if let Err(e) = self.recv.flow_control().release_capacity(n) {
                log::debug!("[h2] release_capacity: {}", e);
            }
        }
        n
    }
}

impl AsyncRead for H2Io {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            this.copy_pending(buf);
            return Poll::Ready(Ok(()));
        }
        match futures::ready!(this.recv.poll_data(cx)) {
            Some(Ok(data)) => {
                this.pending = data;
                this.copy_pending(buf);
                Poll::Ready(Ok(()))
            }
            Some(Err(e)) => Poll::Ready(Err(h2_io(e))),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for H2Io {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.send.reserve_capacity(buf.len());
        loop {
            match futures::ready!(this.send.poll_capacity(cx)) {
                Some(Ok(0)) => continue,
                Some(Ok(n)) => {
                    let n = n.min(buf.len());
                    this.send
                        .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                        .map_err(h2_io)?;
                    return Poll::Ready(Ok(n));
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_io(e))),
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "h2 stream closed",
                    )))
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.send.send_data(Bytes::new(), true).map_err(h2_io)?;
        Poll::Ready(Ok(()))
    }
}

fn h2_io(e: h2::Error) -> io::Error {
    if e.is_io() {
        e.into_io().expect("checked is_io")
    } else {
        io::Error::new(io::ErrorKind::Other, e)
    }
}
