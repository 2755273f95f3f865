//! Stream endpoints
//!
//! A conduit is the local end of a virtual stream: the SOCKS5 ingress and
//! the exit bridge read and write plaintext through it, while the engine
//! moves the framed (and, between endpoints, encrypted) bytes underneath.
//! The reader and writer halves are independent so each splice direction
//! runs as its own task.

use crate::stream::crypto::{OpenCipher, SealCipher, TAG_LEN};
use crate::wire::{Frame, ResetCode, MAX_DATA_PAYLOAD};
use bytes::Bytes;
use std::io;
use tokio::sync::mpsc;

/// Largest plaintext chunk per frame, leaving room for the AEAD tag.
pub const CHUNK_SIZE: usize = MAX_DATA_PAYLOAD - TAG_LEN;

/// What the engine delivers to a local endpoint.
#[derive(Debug)]
pub enum ConduitEvent {
    Data { payload: Bytes, fin_write: bool, fin_read: bool },
    Closed,
    Reset(ResetCode),
}

/// Receiving half of a local stream endpoint.
#[derive(Debug)]
pub struct ConduitReader {
    inbound: mpsc::Receiver<ConduitEvent>,
    cipher: Option<OpenCipher>,
    finished: bool,
}

impl ConduitReader {
    pub(crate) fn new(inbound: mpsc::Receiver<ConduitEvent>, cipher: Option<OpenCipher>) -> Self {
        Self { inbound, cipher, finished: false }
    }

    /// Next chunk of plaintext. `Ok(None)` is a clean end of stream; resets
    /// surface as `ConnectionReset` errors.
    pub async fn read(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            match self.inbound.recv().await {
                Some(ConduitEvent::Data { payload, fin_write, .. }) => {
                    if fin_write {
                        self.finished = true;
                    }
                    if payload.is_empty() {
                        // Binding frames and bare FINs carry no bytes.
                        if self.finished {
                            return Ok(None);
                        }
                        continue;
                    }
                    let plain = match &mut self.cipher {
                        Some(cipher) => Bytes::from(cipher.open(&payload).map_err(|e| {
                            io::Error::new(io::ErrorKind::InvalidData, e)
                        })?),
                        None => payload,
                    };
                    return Ok(Some(plain));
                }
                Some(ConduitEvent::Closed) | None => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(ConduitEvent::Reset(code)) => {
                    self.finished = true;
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        format!("stream reset: {:?}", code),
                    ));
                }
            }
        }
    }
}

/// Sending half of a local stream endpoint.
#[derive(Debug)]
pub struct ConduitWriter {
    /// Stream id on the hop this endpoint faces (0 for in-process delivery).
    stream_id: u64,
    outbound: mpsc::Sender<Frame>,
    cipher: Option<SealCipher>,
    fin_sent: bool,
}

impl ConduitWriter {
    pub(crate) fn new(stream_id: u64, outbound: mpsc::Sender<Frame>, cipher: Option<SealCipher>) -> Self {
        Self { stream_id, outbound, cipher, fin_sent: false }
    }

    async fn send(&self, frame: Frame) -> io::Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream torn down"))
    }

    /// Write plaintext, chunked and sealed into data frames. Backpressure
    /// comes from the bounded frame channel underneath.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.fin_sent {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write after shutdown"));
        }
        for chunk in data.chunks(CHUNK_SIZE) {
            let payload = match &mut self.cipher {
                Some(cipher) => Bytes::from(cipher.seal(chunk)),
                None => Bytes::copy_from_slice(chunk),
            };
            let frame = Frame::StreamData {
                stream_id: self.stream_id,
                fin_write: false,
                fin_read: false,
                payload,
            };
            self.send(frame).await?;
        }
        Ok(())
    }

    /// Half-close: no more bytes from this side.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        if self.fin_sent {
            return Ok(());
        }
        self.fin_sent = true;
        self.send(Frame::StreamData {
            stream_id: self.stream_id,
            fin_write: true,
            fin_read: false,
            payload: Bytes::new(),
        })
        .await
    }

    /// Graceful full close once both directions have finished.
    pub async fn close(&mut self) {
        self.send(Frame::StreamClose { stream_id: self.stream_id }).await.ok();
    }

    /// Abrupt teardown in both directions.
    pub async fn reset(&mut self, code: ResetCode) {
        self.send(Frame::StreamReset { stream_id: self.stream_id, code }).await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plaintext_write_read_through_channels() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(8);

        let mut writer = ConduitWriter::new(7, frame_tx, None);
        writer.write(b"hello mesh").await.unwrap();
        writer.shutdown().await.unwrap();

        let Frame::StreamData { stream_id, payload, fin_write, .. } = frame_rx.recv().await.unwrap()
        else {
            panic!("data frame expected")
        };
        assert_eq!(stream_id, 7);
        assert_eq!(&payload[..], b"hello mesh");
        assert!(!fin_write);
        let Frame::StreamData { fin_write: true, payload: empty, .. } = frame_rx.recv().await.unwrap()
        else {
            panic!("fin frame expected")
        };
        assert!(empty.is_empty());

        let mut reader = ConduitReader::new(event_rx, None);
        event_tx
            .send(ConduitEvent::Data {
                payload: Bytes::from_static(b"reply"),
                fin_write: false,
                fin_read: false,
            })
            .await
            .unwrap();
        event_tx
            .send(ConduitEvent::Data { payload: Bytes::new(), fin_write: true, fin_read: false })
            .await
            .unwrap();
        assert_eq!(reader.read().await.unwrap().unwrap(), Bytes::from_static(b"reply"));
        assert!(reader.read().await.unwrap().is_none());
        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_chunks_large_buffers() {
        let (frame_tx, mut frame_rx) = mpsc::channel(64);
        let mut writer = ConduitWriter::new(1, frame_tx, None);
        let big = vec![0xabu8; CHUNK_SIZE * 2 + 10];
        writer.write(&big).await.unwrap();

        let mut total = 0;
        for _ in 0..3 {
            let Frame::StreamData { payload, .. } = frame_rx.recv().await.unwrap() else {
                panic!("data frame expected")
            };
            assert!(payload.len() <= CHUNK_SIZE);
            total += payload.len();
        }
        assert_eq!(total, big.len());
    }

    #[tokio::test]
    async fn test_reset_surfaces_as_connection_reset() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let mut reader = ConduitReader::new(event_rx, None);
        event_tx.send(ConduitEvent::Reset(ResetCode::Timeout)).await.unwrap();
        let err = reader.read().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_write_after_shutdown_rejected() {
        let (frame_tx, _frame_rx) = mpsc::channel(8);
        let mut writer = ConduitWriter::new(1, frame_tx, None);
        writer.shutdown().await.unwrap();
        assert!(writer.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_encrypted_roundtrip_through_conduits() {
        use crate::stream::crypto::Ephemeral;

        let ingress = Ephemeral::generate();
        let exit = Ephemeral::generate();
        let ingress_pub = ingress.public_key_bytes();
        let exit_pub = exit.public_key_bytes();
        let (ingress_seal, _ingress_open) = ingress.into_ingress_session(&exit_pub).unwrap();
        let (_exit_seal, exit_open) = exit.into_exit_session(&ingress_pub).unwrap();

        let (frame_tx, mut frame_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);

        let mut writer = ConduitWriter::new(1, frame_tx, Some(ingress_seal));
        writer.write(b"secret request").await.unwrap();

        // Transit view: ciphertext only.
        let Frame::StreamData { payload, .. } = frame_rx.recv().await.unwrap() else {
            panic!("data frame expected")
        };
        assert_ne!(&payload[..], b"secret request");

        event_tx
            .send(ConduitEvent::Data { payload, fin_write: false, fin_read: false })
            .await
            .unwrap();
        let mut reader = ConduitReader::new(event_rx, Some(exit_open));
        assert_eq!(reader.read().await.unwrap().unwrap(), Bytes::from_static(b"secret request"));
    }
}
