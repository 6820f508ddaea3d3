//! Datagram plane: unreliable, unordered side traffic.
//!
//! Each datagram carries a 6-byte header - `channelId` (u8), `flags` (u8,
//! zero in v0.1), `requestId` (u32 BE, zero means session-global) - then
//! payload. Receivers must tolerate loss, reordering, and duplication;
//! senders never queue: anything that cannot go out right now is dropped
//! and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::SessionTransport;

/// Length of the datagram header.
pub const DATAGRAM_HEADER_LEN: usize = 6;

/// Datagram channels defined by v0.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DatagramChannel {
    Reserved = 0x00,
    Progress = 0x01,
    Audio = 0x02,
    Log = 0x03,
}

impl DatagramChannel {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Reserved),
            0x01 => Some(Self::Progress),
            0x02 => Some(Self::Audio),
            0x03 => Some(Self::Log),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        *self as u8
    }

    /// Channels that yield first under sustained loss.
    fn throttleable(&self) -> bool {
        matches!(self, Self::Progress | Self::Log)
    }
}

/// Parsed datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub channel: DatagramChannel,
    pub flags: u8,
    pub request_id: u32,
}

impl DatagramHeader {
    pub fn encode(&self) -> [u8; DATAGRAM_HEADER_LEN] {
        let mut buf = [0u8; DATAGRAM_HEADER_LEN];
        buf[0] = self.channel.as_byte();
        buf[1] = self.flags;
        buf[2..].copy_from_slice(&self.request_id.to_be_bytes());
        buf
    }

    /// Parse the raw header bytes. Unknown channel bytes decode to `None`.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < DATAGRAM_HEADER_LEN {
            return None;
        }
        Some(Self {
            channel: DatagramChannel::from_byte(buf[0])?,
            flags: buf[1],
            request_id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
        })
    }
}

/// A received, validated datagram.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub channel: DatagramChannel,
    pub request_id: u32,
    pub payload: Bytes,
}

/// What happened to a send attempt. Nothing is ever queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Header plus payload exceeded the size cap.
    DroppedOversize,
    /// Transport refused (queue full or session gone).
    Dropped,
    /// Discarded because the plane is throttling this channel.
    Throttled,
    /// The session never negotiated datagram support.
    NotSupported,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped_oversize: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_unroutable: AtomicU64,
}

/// Point-in-time counter snapshot for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramStats {
    pub sent: u64,
    pub dropped_oversize: u64,
    pub dropped_malformed: u64,
    pub dropped_unroutable: u64,
}

/// Encodes, decodes, and routes datagrams for one session.
pub struct DatagramPlane {
    transport: Arc<dyn SessionTransport>,
    supported: bool,
    max_size: usize,
    subscribers: DashMap<(u8, u32), mpsc::Sender<Datagram>>,
    throttle_tx: watch::Sender<bool>,
    counters: Counters,
}

impl DatagramPlane {
    pub fn new(transport: Arc<dyn SessionTransport>, supported: bool, max_size: usize) -> Self {
        let (throttle_tx, _) = watch::channel(false);
        Self {
            transport,
            supported,
            max_size,
            subscribers: DashMap::new(),
            throttle_tx,
            counters: Counters::default(),
        }
    }

    /// Send one datagram bound to `request_id` (0 for session-global).
    pub async fn send(
        &self,
        channel: DatagramChannel,
        request_id: u32,
        payload: &[u8],
    ) -> SendOutcome {
        if !self.supported {
            return SendOutcome::NotSupported;
        }
        if channel == DatagramChannel::Reserved {
            self.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            return SendOutcome::Dropped;
        }
        if *self.throttle_tx.borrow() && channel.throttleable() {
            return SendOutcome::Throttled;
        }

        let total = DATAGRAM_HEADER_LEN + payload.len();
        if total > self.max_size {
            self.counters
                .dropped_oversize
                .fetch_add(1, Ordering::Relaxed);
            debug!(total, max = self.max_size, "oversize datagram dropped");
            return SendOutcome::DroppedOversize;
        }

        let header = DatagramHeader {
            channel,
            flags: 0,
            request_id,
        };
        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(&header.encode());
        buf.put_slice(payload);

        match self.transport.send_datagram(buf.freeze()).await {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Sent
            }
            Err(TransportError::DatagramQueueFull) => SendOutcome::Dropped,
            Err(_) => SendOutcome::Dropped,
        }
    }

    /// Subscribe to a channel for one request (0 = session-global).
    pub fn subscribe(
        &self,
        channel: DatagramChannel,
        request_id: u32,
    ) -> mpsc::Receiver<Datagram> {
        let (tx, rx) = mpsc::channel(32);
        self.subscribers.insert((channel.as_byte(), request_id), tx);
        rx
    }

    /// Drop the subscription for `(channel, request_id)`.
    pub fn unsubscribe(&self, channel: DatagramChannel, request_id: u32) {
        self.subscribers.remove(&(channel.as_byte(), request_id));
    }

    /// Receive datagrams from the transport until the session closes.
    pub async fn run_recv_loop(self: Arc<Self>) {
        loop {
            let raw = match self.transport.recv_datagram().await {
                Ok(raw) => raw,
                Err(_) => break,
            };
            self.route(raw);
        }
    }

    fn route(&self, raw: Bytes) {
        // A peer sending datagrams we never negotiated is not fatal.
        if !self.supported {
            return;
        }

        let Some(header) = DatagramHeader::decode(&raw) else {
            self.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            warn!(len = raw.len(), "malformed datagram dropped");
            return;
        };
        if header.flags != 0 || header.channel == DatagramChannel::Reserved {
            self.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            warn!(
                flags = header.flags,
                channel = header.channel.as_byte(),
                "datagram with invalid header dropped"
            );
            return;
        }

        let datagram = Datagram {
            channel: header.channel,
            request_id: header.request_id,
            payload: raw.slice(DATAGRAM_HEADER_LEN..),
        };

        let keyed = self
            .subscribers
            .get(&(header.channel.as_byte(), header.request_id))
            .map(|s| s.value().clone());
        let target = keyed.or_else(|| {
            self.subscribers
                .get(&(header.channel.as_byte(), 0))
                .map(|s| s.value().clone())
        });

        // try_send: a slow subscriber loses datagrams, it never blocks the
        // pump or grows a queue.
        let delivered = match target {
            Some(tx) => tx.try_send(datagram).is_ok(),
            None => false,
        };
        if !delivered {
            self.counters
                .dropped_unroutable
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Flip the "please slow down" signal from the embedder's loss signal.
    pub fn set_throttled(&self, throttled: bool) {
        self.throttle_tx.send_replace(throttled);
    }

    pub fn is_throttled(&self) -> bool {
        *self.throttle_tx.borrow()
    }

    /// Watch the throttle flag; emitting handlers may observe it.
    pub fn throttle_signal(&self) -> watch::Receiver<bool> {
        self.throttle_tx.subscribe()
    }

    pub fn stats(&self) -> DatagramStats {
        DatagramStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped_oversize: self.counters.dropped_oversize.load(Ordering::Relaxed),
            dropped_malformed: self.counters.dropped_malformed.load(Ordering::Relaxed),
            dropped_unroutable: self.counters.dropped_unroutable.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_DATAGRAM_PAYLOAD_SIZE;
    use crate::transport::MemSession;

    fn setup(supported: bool) -> (Arc<DatagramPlane>, MemSession) {
        let (client, server) = MemSession::pair();
        let plane = Arc::new(DatagramPlane::new(
            Arc::new(server),
            supported,
            MAX_DATAGRAM_PAYLOAD_SIZE,
        ));
        (plane, client)
    }

    #[test]
    fn test_header_roundtrip() {
        let header = DatagramHeader {
            channel: DatagramChannel::Progress,
            flags: 0,
            request_id: 99,
        };
        let encoded = header.encode();
        assert_eq!(encoded, [0x01, 0x00, 0, 0, 0, 99]);
        assert_eq!(DatagramHeader::decode(&encoded), Some(header));
    }

    #[test]
    fn test_unknown_channel_byte() {
        assert!(DatagramHeader::decode(&[0x7f, 0, 0, 0, 0, 1]).is_none());
    }

    #[tokio::test]
    async fn test_send_and_route() {
        let (plane, client) = setup(true);
        let client_plane = Arc::new(DatagramPlane::new(
            Arc::new(client),
            true,
            MAX_DATAGRAM_PAYLOAD_SIZE,
        ));
        let mut rx = client_plane.subscribe(DatagramChannel::Progress, 7);
        tokio::spawn(Arc::clone(&client_plane).run_recv_loop());

        let outcome = plane.send(DatagramChannel::Progress, 7, b"50%").await;
        assert_eq!(outcome, SendOutcome::Sent);

        let datagram = rx.recv().await.unwrap();
        assert_eq!(datagram.channel, DatagramChannel::Progress);
        assert_eq!(datagram.request_id, 7);
        assert_eq!(datagram.payload.as_ref(), b"50%");
    }

    #[tokio::test]
    async fn test_global_subscriber_fallback() {
        let (plane, client) = setup(true);
        let client_plane = Arc::new(DatagramPlane::new(
            Arc::new(client),
            true,
            MAX_DATAGRAM_PAYLOAD_SIZE,
        ));
        let mut rx = client_plane.subscribe(DatagramChannel::Log, 0);
        tokio::spawn(Arc::clone(&client_plane).run_recv_loop());

        plane.send(DatagramChannel::Log, 42, b"line").await;
        let datagram = rx.recv().await.unwrap();
        assert_eq!(datagram.request_id, 42);
    }

    #[tokio::test]
    async fn test_oversize_dropped_locally() {
        let (plane, _client) = setup(true);
        let payload = vec![0u8; MAX_DATAGRAM_PAYLOAD_SIZE];
        let outcome = plane
            .send(DatagramChannel::Audio, 1, &payload)
            .await;
        assert_eq!(outcome, SendOutcome::DroppedOversize);
        assert_eq!(plane.stats().dropped_oversize, 1);
        assert_eq!(plane.stats().sent, 0);
    }

    #[tokio::test]
    async fn test_nonzero_flags_never_delivered() {
        let (plane, client) = setup(true);
        let mut rx = plane.subscribe(DatagramChannel::Progress, 0);
        let recv_plane = Arc::clone(&plane);
        tokio::spawn(recv_plane.run_recv_loop());

        let mut raw = DatagramHeader {
            channel: DatagramChannel::Progress,
            flags: 0,
            request_id: 1,
        }
        .encode()
        .to_vec();
        raw[1] = 0x80;
        raw.extend_from_slice(b"x");
        client.send_datagram(Bytes::from(raw)).await.unwrap();

        // A valid datagram after the bad one proves the bad one was dropped.
        let good = DatagramHeader {
            channel: DatagramChannel::Progress,
            flags: 0,
            request_id: 1,
        };
        let mut raw = good.encode().to_vec();
        raw.extend_from_slice(b"ok");
        client.send_datagram(Bytes::from(raw)).await.unwrap();

        let datagram = rx.recv().await.unwrap();
        assert_eq!(datagram.payload.as_ref(), b"ok");
        assert_eq!(plane.stats().dropped_malformed, 1);
    }

    #[tokio::test]
    async fn test_reserved_channel_dropped() {
        let (plane, client) = setup(true);
        let mut rx = plane.subscribe(DatagramChannel::Progress, 0);
        tokio::spawn(Arc::clone(&plane).run_recv_loop());

        let mut raw = vec![0x00, 0x00, 0, 0, 0, 1];
        raw.extend_from_slice(b"nope");
        client.send_datagram(Bytes::from(raw)).await.unwrap();

        let good = DatagramHeader {
            channel: DatagramChannel::Progress,
            flags: 0,
            request_id: 1,
        };
        let mut raw = good.encode().to_vec();
        raw.extend_from_slice(b"ok");
        client.send_datagram(Bytes::from(raw)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().payload.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn test_unsupported_drops_both_ways() {
        let (plane, client) = setup(false);
        assert_eq!(
            plane.send(DatagramChannel::Progress, 1, b"x").await,
            SendOutcome::NotSupported
        );

        // Inbound datagrams in the unsupported state vanish silently.
        tokio::spawn(Arc::clone(&plane).run_recv_loop());
        let good = DatagramHeader {
            channel: DatagramChannel::Progress,
            flags: 0,
            request_id: 1,
        };
        let mut raw = good.encode().to_vec();
        raw.extend_from_slice(b"ignored");
        client.send_datagram(Bytes::from(raw)).await.unwrap();
        assert_eq!(plane.stats().dropped_malformed, 0);
    }

    #[tokio::test]
    async fn test_throttle_sheds_progress_before_audio() {
        let (plane, _client) = setup(true);
        plane.set_throttled(true);

        assert_eq!(
            plane.send(DatagramChannel::Progress, 1, b"x").await,
            SendOutcome::Throttled
        );
        assert_eq!(
            plane.send(DatagramChannel::Log, 1, b"x").await,
            SendOutcome::Throttled
        );
        assert_eq!(
            plane.send(DatagramChannel::Audio, 1, b"x").await,
            SendOutcome::Sent
        );

        plane.set_throttled(false);
        assert_eq!(
            plane.send(DatagramChannel::Progress, 1, b"x").await,
            SendOutcome::Sent
        );
    }
}
