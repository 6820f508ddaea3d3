//! In-process session transport pair.
//!
//! Streams are modelled as bounded byte channels, datagrams as a lossy
//! bounded channel (send on a full queue drops, like the real thing).
//! Both halves share one closed flag so either side can tear the session
//! down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify, mpsc};

use crate::error::{TransportError, TransportResult};

use super::{SessionTransport, StreamReader, StreamWriter};

const STREAM_CHANNEL_CAPACITY: usize = 64;
const DATAGRAM_CHANNEL_CAPACITY: usize = 256;
const ACCEPT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug)]
enum StreamEvent {
    Data(Bytes),
    Finish,
    Reset(u32),
}

/// Write half of an in-memory stream.
pub struct MemStreamWriter {
    tx: mpsc::Sender<StreamEvent>,
    finished: bool,
}

#[async_trait]
impl StreamWriter for MemStreamWriter {
    async fn write_all(&mut self, buf: &[u8]) -> TransportResult<()> {
        if self.finished {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(StreamEvent::Data(Bytes::copy_from_slice(buf)))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.tx
            .send(StreamEvent::Finish)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn reset(&mut self, code: u32) {
        self.finished = true;
        let _ = self.tx.try_send(StreamEvent::Reset(code));
    }
}

impl Drop for MemStreamWriter {
    fn drop(&mut self) {
        // Dropping an unfinished writer is an abrupt close.
        if !self.finished {
            let _ = self.tx.try_send(StreamEvent::Reset(0));
        }
    }
}

/// Read half of an in-memory stream.
pub struct MemStreamReader {
    rx: mpsc::Receiver<StreamEvent>,
    pending: Bytes,
    eof: bool,
}

#[async_trait]
impl StreamReader for MemStreamReader {
    async fn read(&mut self, buf: &mut [u8]) -> TransportResult<Option<usize>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending = self.pending.slice(n..);
                return Ok(Some(n));
            }
            if self.eof {
                return Ok(None);
            }
            match self.rx.recv().await {
                Some(StreamEvent::Data(bytes)) => self.pending = bytes,
                Some(StreamEvent::Finish) | None => {
                    self.eof = true;
                    return Ok(None);
                }
                Some(StreamEvent::Reset(code)) => {
                    self.eof = true;
                    return Err(TransportError::Reset(code));
                }
            }
        }
    }

    fn stop(&mut self, _code: u32) {
        self.rx.close();
    }
}

fn stream_pipe() -> (MemStreamWriter, MemStreamReader) {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    (
        MemStreamWriter {
            tx,
            finished: false,
        },
        MemStreamReader {
            rx,
            pending: Bytes::new(),
            eof: false,
        },
    )
}

struct MemHalf {
    uni_out: mpsc::Sender<MemStreamReader>,
    bi_out: mpsc::Sender<(MemStreamWriter, MemStreamReader)>,
    dgram_out: mpsc::Sender<Bytes>,
    uni_in: Mutex<mpsc::Receiver<MemStreamReader>>,
    bi_in: Mutex<mpsc::Receiver<(MemStreamWriter, MemStreamReader)>>,
    dgram_in: Mutex<mpsc::Receiver<Bytes>>,
}

/// One endpoint of an in-process WebTransport session.
#[derive(Clone)]
pub struct MemSession {
    half: Arc<MemHalf>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
}

impl MemSession {
    /// Create a connected pair of session endpoints.
    pub fn pair() -> (Self, Self) {
        let (uni_tx_a, uni_rx_a) = mpsc::channel(ACCEPT_CHANNEL_CAPACITY);
        let (uni_tx_b, uni_rx_b) = mpsc::channel(ACCEPT_CHANNEL_CAPACITY);
        let (bi_tx_a, bi_rx_a) = mpsc::channel(ACCEPT_CHANNEL_CAPACITY);
        let (bi_tx_b, bi_rx_b) = mpsc::channel(ACCEPT_CHANNEL_CAPACITY);
        let (dgram_tx_a, dgram_rx_a) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
        let (dgram_tx_b, dgram_rx_b) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);

        let closed = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(Notify::new());

        let a = Self {
            half: Arc::new(MemHalf {
                uni_out: uni_tx_b,
                bi_out: bi_tx_b,
                dgram_out: dgram_tx_b,
                uni_in: Mutex::new(uni_rx_a),
                bi_in: Mutex::new(bi_rx_a),
                dgram_in: Mutex::new(dgram_rx_a),
            }),
            closed: Arc::clone(&closed),
            close_notify: Arc::clone(&close_notify),
        };
        let b = Self {
            half: Arc::new(MemHalf {
                uni_out: uni_tx_a,
                bi_out: bi_tx_a,
                dgram_out: dgram_tx_a,
                uni_in: Mutex::new(uni_rx_b),
                bi_in: Mutex::new(bi_rx_b),
                dgram_in: Mutex::new(dgram_rx_b),
            }),
            closed,
            close_notify,
        };
        (a, b)
    }

    /// Open a bidirectional stream towards the peer.
    ///
    /// The engine never opens bidirectional streams, so this lives outside
    /// the [`SessionTransport`] trait; test clients use it to open the
    /// Control Stream.
    pub async fn open_bi(
        &self,
    ) -> TransportResult<(Box<dyn StreamWriter>, Box<dyn StreamReader>)> {
        self.check_open()?;
        let (my_writer, peer_reader) = stream_pipe();
        let (peer_writer, my_reader) = stream_pipe();
        self.half
            .bi_out
            .send((peer_writer, peer_reader))
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok((Box::new(my_writer), Box::new(my_reader)))
    }

    fn check_open(&self) -> TransportResult<()> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionTransport for MemSession {
    async fn accept_bi(
        &self,
    ) -> TransportResult<(Box<dyn StreamWriter>, Box<dyn StreamReader>)> {
        self.check_open()?;
        let mut rx = self.half.bi_in.lock().await;
        tokio::select! {
            stream = rx.recv() => {
                let (writer, reader) = stream.ok_or(TransportError::Closed)?;
                Ok((Box::new(writer), Box::new(reader)))
            }
            _ = self.close_notify.notified() => Err(TransportError::Closed),
        }
    }

    async fn open_uni(&self) -> TransportResult<Box<dyn StreamWriter>> {
        self.check_open()?;
        let (writer, reader) = stream_pipe();
        self.half
            .uni_out
            .send(reader)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(Box::new(writer))
    }

    async fn accept_uni(&self) -> TransportResult<Box<dyn StreamReader>> {
        self.check_open()?;
        let mut rx = self.half.uni_in.lock().await;
        tokio::select! {
            stream = rx.recv() => {
                let reader = stream.ok_or(TransportError::Closed)?;
                Ok(Box::new(reader))
            }
            _ = self.close_notify.notified() => Err(TransportError::Closed),
        }
    }

    async fn send_datagram(&self, payload: Bytes) -> TransportResult<()> {
        self.check_open()?;
        // Unreliable delivery: a full queue drops the datagram.
        match self.half.dgram_out.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::DatagramQueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    async fn recv_datagram(&self) -> TransportResult<Bytes> {
        self.check_open()?;
        let mut rx = self.half.dgram_in.lock().await;
        tokio::select! {
            datagram = rx.recv() => datagram.ok_or(TransportError::Closed),
            _ = self.close_notify.notified() => Err(TransportError::Closed),
        }
    }

    async fn close(&self, _code: u32, _reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }

    async fn closed(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
