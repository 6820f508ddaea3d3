//! In-flight request registry.
//!
//! The Request Table is the session's one hot shared structure: the control
//! loop registers requests, handlers allocate stream tags, the mux binds
//! and unbinds streams, and the lifecycle orchestrator cancels. All of it
//! funnels through a single `parking_lot::Mutex` so response/complete races
//! cannot happen.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{RequestId, StreamErrorParams};
use crate::transport::StreamReader;

/// A peer-opened Execution Stream handed to the owning handler.
pub struct InboundStream {
    pub stream_tag: u32,
    pub reader: Box<dyn StreamReader>,
}

/// Level-triggered cancellation signal observed by handlers.
///
/// Handlers poll [`is_cancelled`](CancelToken::is_cancelled) at suspension
/// points or await [`cancelled`](CancelToken::cancelled); they are never
/// force-killed.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<Option<String>>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolves once the request is cancelled. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if rx.borrow().is_some() {
                return;
            }
            if rx.changed().await.is_err() {
                // Entry completed without cancellation; stay pending so
                // `select!` arms fall through to the real work.
                std::future::pending::<()>().await;
            }
        }
    }
}

struct Entry {
    method: String,
    wire_id: Option<u32>,
    cancel_tx: watch::Sender<Option<String>>,
    /// Tags currently bound to live streams.
    bound_tags: HashSet<u32>,
    /// Next tag to hand out; tags below this were declared by the handler.
    next_tag: u32,
    response_sent: bool,
    inbound_tx: Option<mpsc::Sender<InboundStream>>,
    stream_error_tx: Option<mpsc::Sender<StreamErrorParams>>,
}

impl Entry {
    fn is_complete(&self) -> bool {
        self.response_sent && self.bound_tags.is_empty()
    }
}

struct TableInner {
    entries: HashMap<RequestId, Entry>,
    /// Reverse index from the numeric wire id in stream headers.
    wire_ids: HashMap<u32, RequestId>,
}

/// Verdict for a peer-opened stream header, per the mux validation order.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamVerdict {
    Accept(RequestId),
    /// No such in-flight request.
    Injection,
    /// Request exists but never declared this tag.
    InvalidRef,
}

/// Session-local registry of in-flight requests and their streams.
pub struct RequestTable {
    inner: Mutex<TableInner>,
    drained_tx: watch::Sender<bool>,
}

impl RequestTable {
    pub fn new() -> Self {
        let (drained_tx, _) = watch::channel(true);
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                wire_ids: HashMap::new(),
            }),
            drained_tx,
        }
    }

    /// Register a request as in flight.
    pub fn register(&self, id: RequestId, method: &str) -> ProtocolResult<CancelToken> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&id) {
            return Err(ProtocolError::DuplicateRequestId);
        }

        let (cancel_tx, cancel_rx) = watch::channel(None);
        let wire_id = id.as_wire_id();
        if let Some(wire) = wire_id {
            inner.wire_ids.insert(wire, id.clone());
        }
        inner.entries.insert(
            id,
            Entry {
                method: method.to_string(),
                wire_id,
                cancel_tx,
                bound_tags: HashSet::new(),
                next_tag: 1,
                response_sent: false,
                inbound_tx: None,
                stream_error_tx: None,
            },
        );
        self.drained_tx.send_replace(false);
        Ok(CancelToken { rx: cancel_rx })
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    pub fn method(&self, id: &RequestId) -> Option<String> {
        self.inner.lock().entries.get(id).map(|e| e.method.clone())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Allocate the next stream tag for a request. Monotonic, starts at 1.
    pub fn allocate_stream_tag(&self, id: &RequestId) -> ProtocolResult<u32> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| ProtocolError::InvalidRequest("request not in flight".into()))?;
        let tag = entry.next_tag;
        entry.next_tag += 1;
        Ok(tag)
    }

    /// Bind a live stream to `(id, tag)`.
    pub fn bind_stream(&self, id: &RequestId, tag: u32) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.bound_tags.insert(tag);
        }
    }

    /// Unbind a stream once it reaches EOF or is reset. May complete the
    /// request if the response went out earlier.
    pub fn unbind_stream(&self, id: &RequestId, tag: u32) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.bound_tags.remove(&tag);
            trace!(request_id = %id, tag, "stream unbound");
        }
        self.maybe_complete(&mut inner, id);
    }

    /// Signal cancellation. Idempotent; the entry stays until the handler
    /// responds. Unknown ids (already completed) are ignored.
    pub fn cancel(&self, id: &RequestId, reason: Option<String>) -> bool {
        let inner = self.inner.lock();
        let Some(entry) = inner.entries.get(id) else {
            debug!(request_id = %id, "cancel for unknown request ignored");
            return false;
        };
        entry.cancel_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.unwrap_or_else(|| "cancelled".to_string()));
                true
            } else {
                false
            }
        });
        true
    }

    /// Cancel every in-flight request (session teardown).
    pub fn cancel_all(&self, reason: &str) {
        let inner = self.inner.lock();
        for entry in inner.entries.values() {
            entry.cancel_tx.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(reason.to_string());
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Record that the response frame for `id` has been written. The entry
    /// is removed once no bound streams remain.
    pub fn mark_response_sent(&self, id: &RequestId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.response_sent = true;
        }
        self.maybe_complete(&mut inner, id);
    }

    /// Judge a peer-opened stream header against the table.
    pub fn judge_inbound_stream(&self, wire_id: u32, tag: u32) -> StreamVerdict {
        let inner = self.inner.lock();
        let Some(id) = inner.wire_ids.get(&wire_id) else {
            return StreamVerdict::Injection;
        };
        let Some(entry) = inner.entries.get(id) else {
            return StreamVerdict::Injection;
        };
        // Valid tags are those the handler has allocated, whether or not
        // the response declaring them has been written yet.
        if tag == 0 || tag >= entry.next_tag {
            return StreamVerdict::InvalidRef;
        }
        StreamVerdict::Accept(id.clone())
    }

    /// Register the handler-side receiver for peer-opened streams.
    pub fn subscribe_inbound(&self, id: &RequestId) -> Option<mpsc::Receiver<InboundStream>> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(id)?;
        let (tx, rx) = mpsc::channel(8);
        entry.inbound_tx = Some(tx);
        Some(rx)
    }

    /// Deliver a peer-opened stream to the owning handler, if subscribed.
    pub fn deliver_inbound(&self, id: &RequestId, stream: InboundStream) -> bool {
        let tx = {
            let inner = self.inner.lock();
            inner.entries.get(id).and_then(|e| e.inbound_tx.clone())
        };
        match tx {
            Some(tx) => tx.try_send(stream).is_ok(),
            None => false,
        }
    }

    /// Register the handler-side receiver for `$/streamError` observations.
    pub fn subscribe_stream_errors(
        &self,
        id: &RequestId,
    ) -> Option<mpsc::Receiver<StreamErrorParams>> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(id)?;
        let (tx, rx) = mpsc::channel(8);
        entry.stream_error_tx = Some(tx);
        Some(rx)
    }

    /// Route a peer `$/streamError` to the affected request's observer.
    pub fn notify_stream_error(&self, params: StreamErrorParams) -> bool {
        let tx = {
            let inner = self.inner.lock();
            inner
                .wire_ids
                .get(&params.request_id)
                .and_then(|id| inner.entries.get(id))
                .and_then(|e| e.stream_error_tx.clone())
        };
        match tx {
            Some(tx) => tx.try_send(params).is_ok(),
            None => false,
        }
    }

    /// Every `(request wire id, tag)` pair with a live stream. Used for
    /// best-effort `$/streamError` emission on teardown.
    pub fn live_streams(&self) -> Vec<(u32, u32)> {
        let inner = self.inner.lock();
        inner
            .entries
            .values()
            .filter_map(|entry| entry.wire_id.map(|wire| (wire, &entry.bound_tags)))
            .flat_map(|(wire, tags)| tags.iter().map(move |tag| (wire, *tag)))
            .collect()
    }

    /// Observer that flips to `true` whenever the table is empty.
    pub fn drained(&self) -> watch::Receiver<bool> {
        self.drained_tx.subscribe()
    }

    fn maybe_complete(&self, inner: &mut TableInner, id: &RequestId) {
        let done = inner.entries.get(id).is_some_and(Entry::is_complete);
        if done {
            if let Some(entry) = inner.entries.remove(id) {
                if let Some(wire) = entry.wire_id {
                    inner.wire_ids.remove(&wire);
                }
                debug!(request_id = %id, method = %entry.method, "request complete");
            }
        }
        if inner.entries.is_empty() {
            self.drained_tx.send_replace(true);
        }
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}
