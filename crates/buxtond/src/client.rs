//! The connected-client table: per-peer identity and outbound queue.
//!
//! One entry per accepted connection, keyed by a monotonic id assigned at
//! accept time. The writer task owns the only consumer of `outbox`; direct
//! replies and `CHANGED` fanout both funnel through it so a single
//! connection never has two concurrent writers.

use std::sync::atomic::{AtomicU64, Ordering};

use buxton_core::model::Label;
use buxton_services::ClientId;
use dashmap::DashMap;
use tokio::sync::mpsc;

pub struct ClientHandle {
    pub uid: u32,
    pub label: Label,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
}

impl ClientHandle {
    /// Queue a frame for delivery. Silently dropped if the writer task has
    /// already exited (the connection is closing).
    pub fn send(&self, frame: Vec<u8>) {
        let _ = self.outbox.send(frame);
    }
}

#[derive(Default)]
pub struct ClientTable {
    next_id: AtomicU64,
    clients: DashMap<ClientId, ClientHandle>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, uid: u32, label: Label, outbox: mpsc::UnboundedSender<Vec<u8>>) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(id, ClientHandle { uid, label, outbox });
        id
    }

    pub fn remove(&self, id: ClientId) {
        self.clients.remove(&id);
    }

    pub fn send(&self, id: ClientId, frame: Vec<u8>) {
        if let Some(handle) = self.clients.get(&id) {
            handle.send(frame);
        }
    }

    pub fn label_of(&self, id: ClientId) -> Option<Label> {
        self.clients.get(&id).map(|h| h.label.clone())
    }

    /// Kernel security labels can change mid-connection; called before
    /// dispatching every inbound message to keep the table current.
    pub fn update_label(&self, id: ClientId, label: Label) {
        if let Some(mut handle) = self.clients.get_mut(&id) {
            handle.label = label;
        }
    }

    pub fn connected_count(&self) -> usize {
        self.clients.len()
    }
}
