//! WebSocket transport
//!
//! One WebSocket connection per peer carries binary messages; a small mux
//! header `{ u8 op, u64 substream-id }` on every message emulates the stream
//! layer in the application. The dialling side allocates odd substream ids,
//! the accepting side even ones.
//!
//! Unlike QUIC and HTTP/2 there is no native per-stream flow control here:
//! inbound dispatch applies backpressure through bounded per-substream
//! channels, at the cost of head-of-line blocking on the shared socket when
//! one consumer stalls. The `plaintext` listener option skips TLS for
//! deployments behind a TLS-terminating reverse proxy on localhost.

use super::tls;
use crate::config::{ListenerConfig, PeerConfig};
use crate::transport::{resolve, split_host_port, Acceptor, BoxAcceptor, BoxLink, BoxStream, Link};
use anyhow::{anyhow, Context as AnyhowContext, Result};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const OP_OPEN: u8 = 1;
const OP_DATA: u8 = 2;
const OP_FIN: u8 = 3;
const OP_RESET: u8 = 4;

const MUX_HEADER_LEN: usize = 9;

/// Largest payload packed into one WebSocket message.
const MAX_MESSAGE_PAYLOAD: usize = 64 * 1024;

/// Per-substream inbound queue depth before the socket reader blocks.
const INBOUND_QUEUE: usize = 32;

/// Dial a peer over WebSocket (always TLS on the dialling side).
pub async fn dial(peer: &PeerConfig) -> Result<BoxLink> {
    let (host, port) = split_host_port(&peer.address)?;
    let remote = resolve(&peer.address).await?;

    let mut crypto = tls::client_config(&peer.tls)?;
    crypto.alpn_protocols = vec![b"http/1.1".to_vec()];

    let tcp = TcpStream::connect(remote)
        .await
        .with_context(|| format!("TCP connect to {}", remote))?;
    tcp.set_nodelay(true).ok();
    let local_addr = tcp.local_addr().ok();

    // The URL host doubles as the SNI/Host header, so a configured
    // server_name override replaces it while the socket stays pointed at the
    // resolved dial address.
    let sni_host = peer.tls.server_name.clone().unwrap_or(host);
    let url = format!("wss://{}:{}/mesh", sni_host, port);
    let connector = tokio_tungstenite::Connector::Rustls(Arc::new(crypto));
    let (socket, _response) =
        tokio_tungstenite::client_async_tls_with_config(url.as_str(), tcp, None, Some(connector))
            .await
            .with_context(|| format!("WebSocket handshake with {}", remote))?;

    log::debug!("[ws] connected to {}", remote);
    Ok(Box::new(WsLink::spawn(socket, true, local_addr, Some(remote))))
}

/// Bind a WebSocket listener.
pub async fn listen(listener: &ListenerConfig) -> Result<BoxAcceptor> {
    let tls_acceptor = if listener.plaintext {
        None
    } else {
        let mut crypto = tls::server_config(listener)?;
        crypto.alpn_protocols = vec![b"http/1.1".to_vec()];
        Some(TlsAcceptor::from(Arc::new(crypto)))
    };
    let tcp = TcpListener::bind(listener.bind)
        .await
        .with_context(|| format!("binding ws listener on {}", listener.bind))?;
    log::info!(
        "[ws] listening on {}{}",
        listener.bind,
        if listener.plaintext { " (plaintext)" } else { "" }
    );
    Ok(Box::new(WsAcceptor { tcp, tls: tls_acceptor, path: listener.path.clone() }))
}

struct WsAcceptor {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
    path: String,
}

#[async_trait]
impl Acceptor for WsAcceptor {
    async fn accept(&mut self) -> Result<BoxLink> {
        let (stream, remote) = self.tcp.accept().await.context("TCP accept")?;
        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr().ok();

        let stream = match &self.tls {
            Some(acceptor) => ServerStream::Tls(
                acceptor
                    .accept(stream)
                    .await
                    .with_context(|| format!("TLS handshake with {}", remote))?,
            ),
            None => ServerStream::Plain(stream),
        };

        let expected_path = self.path.clone();
        let check_path = move |request: &Request, response: Response| {
            if request.uri().path() == expected_path {
                Ok(response)
            } else {
                let mut not_found = ErrorResponse::new(Some("not found".to_string()));
                *not_found.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
                Err(not_found)
            }
        };
        let socket = tokio_tungstenite::accept_hdr_async(stream, check_path)
            .await
            .with_context(|| format!("WebSocket handshake with {}", remote))?;

        log::debug!("[ws] accepted connection from {}", remote);
        Ok(Box::new(WsLink::spawn(socket, false, local_addr, Some(remote))))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr().ok()
    }
}

/// Accepted-side socket: TLS or raw TCP behind a terminating proxy.
enum ServerStream {
    Plain(TcpStream),
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

enum InEvent {
    Data(Bytes),
    Fin,
    Reset,
}

type StreamMap = Arc<std::sync::Mutex<HashMap<u64, mpsc::Sender<InEvent>>>>;

struct WsLink {
    outgoing: mpsc::Sender<Message>,
    streams: StreamMap,
    accept_rx: AsyncMutex<mpsc::Receiver<WsSubstream>>,
    next_sid: AtomicU64,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl WsLink {
    fn spawn<S>(
        socket: WebSocketStream<S>,
        dialler: bool,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(64);
        let (mut accept_tx, accept_rx) = mpsc::channel::<WsSubstream>(16);
        let streams: StreamMap = Arc::new(std::sync::Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.next().await {
                if let Err(e) = ws_tx.send(message).await {
                    log::debug!("[ws] write failed: {}", e);
                    break;
                }
            }
            ws_tx.close().await.ok();
        });

        let reader_streams = Arc::clone(&streams);
        let reader_outgoing = outgoing.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                let data = match message {
                    Ok(Message::Binary(data)) => Bytes::from(data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::debug!("[ws] read failed: {}", e);
                        break;
                    }
                };
                if data.len() < MUX_HEADER_LEN {
                    log::debug!("[ws] dropping short mux message ({} bytes)", data.len());
                    continue;
                }
                let mut header = data.clone();
                let op = header.get_u8();
                let sid = header.get_u64();
                let payload = data.slice(MUX_HEADER_LEN..);

                match op {
                    OP_OPEN => {
                        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
                        reader_streams.lock().expect("streams lock").insert(sid, in_tx);
                        let substream =
                            WsSubstream { sid, outgoing: reader_outgoing.clone(), inbound: in_rx, pending: Bytes::new(), read_eof: false, fin_sent: false };
                        if accept_tx.send(substream).await.is_err() {
                            break;
                        }
                    }
                    OP_DATA | OP_FIN | OP_RESET => {
                        let sender = reader_streams.lock().expect("streams lock").get(&sid).cloned();
                        let Some(mut sender) = sender else { continue };
                        let event = match op {
                            OP_DATA => InEvent::Data(payload),
                            OP_FIN => InEvent::Fin,
                            _ => InEvent::Reset,
                        };
                        let terminal = !matches!(event, InEvent::Data(_));
                        // Bounded send: a stalled consumer blocks the whole
                        // socket, which is the backpressure this transport
                        // can offer.
                        if sender.send(event).await.is_err() || terminal {
                            reader_streams.lock().expect("streams lock").remove(&sid);
                        }
                    }
                    other => {
                        log::debug!("[ws] unknown mux op {}", other);
                    }
                }
            }
            // Socket gone: dropping the senders EOFs every substream.
            reader_streams.lock().expect("streams lock").clear();
        });

        Self {
            outgoing,
            streams,
            accept_rx: AsyncMutex::new(accept_rx),
            next_sid: AtomicU64::new(if dialler { 1 } else { 2 }),
            reader,
            writer,
            local_addr,
            remote_addr,
        }
    }
}

fn mux_message(op: u8, sid: u64, payload: &[u8]) -> Message {
    let mut out = Vec::with_capacity(MUX_HEADER_LEN + payload.len());
    out.push(op);
    out.extend_from_slice(&sid.to_be_bytes());
    out.extend_from_slice(payload);
    Message::Binary(out)
}

#[async_trait]
impl Link for WsLink {
    async fn open_stream(&self) -> Result<BoxStream> {
        let sid = self.next_sid.fetch_add(2, Ordering::Relaxed);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        self.streams.lock().expect("streams lock").insert(sid, in_tx);

        let mut outgoing = self.outgoing.clone();
        outgoing
            .send(mux_message(OP_OPEN, sid, &[]))
            .await
            .map_err(|_| anyhow!("ws link closed"))?;

        Ok(Box::new(WsSubstream {
            sid,
            outgoing,
            inbound: in_rx,
            pending: Bytes::new(),
            read_eof: false,
            fin_sent: false,
        }))
    }

    async fn accept_stream(&self) -> Result<BoxStream> {
        let substream = self
            .accept_rx
            .lock()
            .await
            .next()
            .await
            .ok_or_else(|| anyhow!("ws link closed"))?;
        Ok(Box::new(substream))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    async fn close(&self) {
        self.reader.abort();
        self.writer.abort();
        self.streams.lock().expect("streams lock").clear();
    }
}

/// One multiplexed substream over the shared WebSocket.
struct WsSubstream {
    sid: u64,
    outgoing: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<InEvent>,
    pending: Bytes,
    read_eof: bool,
    fin_sent: bool,
}

impl AsyncRead for WsSubstream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending.split_to(n));
            return Poll::Ready(Ok(()));
        }
        if this.read_eof {
            return Poll::Ready(Ok(()));
        }
        match futures::ready!(Pin::new(&mut this.inbound).poll_next(cx)) {
            Some(InEvent::Data(data)) => {
                this.pending = data;
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                Poll::Ready(Ok(()))
            }
            Some(InEvent::Fin) | None => {
                this.read_eof = true;
                Poll::Ready(Ok(()))
            }
            Some(InEvent::Reset) => {
                this.read_eof = true;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "substream reset by peer",
                )))
            }
        }
    }
}

impl AsyncWrite for WsSubstream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        futures::ready!(this.outgoing.poll_ready(cx)).map_err(closed_pipe)?;
        let n = buf.len().min(MAX_MESSAGE_PAYLOAD);
        this.outgoing
            .start_send(mux_message(OP_DATA, this.sid, &buf[..n]))
            .map_err(closed_pipe)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.fin_sent {
            return Poll::Ready(Ok(()));
        }
        futures::ready!(this.outgoing.poll_ready(cx)).map_err(closed_pipe)?;
        this.outgoing
            .start_send(mux_message(OP_FIN, this.sid, &[]))
            .map_err(closed_pipe)?;
        this.fin_sent = true;
        Poll::Ready(Ok(()))
    }
}

fn closed_pipe<E>(_: E) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "ws link closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_message_layout() {
        let message = mux_message(OP_DATA, 0x0102_0304_0506_0708, b"xy");
        let Message::Binary(bytes) = message else { panic!("binary expected") };
        assert_eq!(bytes[0], OP_DATA);
        assert_eq!(&bytes[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[9..], b"xy");
    }

    #[test]
    fn test_sid_allocation_sides_disjoint() {
        // Dialler takes odd ids, acceptor even; fetch_add(2) keeps them
        // disjoint without coordination.
        let dialler = AtomicU64::new(1);
        let acceptor = AtomicU64::new(2);
        let d: Vec<u64> = (0..4).map(|_| dialler.fetch_add(2, Ordering::Relaxed)).collect();
        let a: Vec<u64> = (0..4).map(|_| acceptor.fetch_add(2, Ordering::Relaxed)).collect();
        assert_eq!(d, vec![1, 3, 5, 7]);
        assert_eq!(a, vec![2, 4, 6, 8]);
    }
}
