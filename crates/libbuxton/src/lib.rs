//! Async client library for the Buxton protocol.
//!
//! A single background reader task demultiplexes every inbound frame by
//! `msgid`: `STATUS` replies complete the matching in-flight request;
//! `CHANGED` frames are forwarded to whichever subscription registered
//! that `msgid` with a prior `NOTIFY`. This is the `msgid -> callback`
//! correlation table spec.md's client component describes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use buxton_core::model::{Key, Label, Value};
use buxton_core::status::StatusCode;
use buxton_core::wire::{self, Direction, Frame, MsgType, Param};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// How long a request waits for its `STATUS` reply before giving up.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection closed")]
    Closed,
    #[error("request timed out")]
    Timeout,
    #[error("server returned {0}")]
    Status(StatusCode),
    #[error("malformed reply")]
    Malformed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One `CHANGED` delivery for an active subscription.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub group: String,
    pub name: Option<String>,
    pub value: Option<Value>,
    pub label: Option<Label>,
}

struct Pending {
    reply: HashMap<u64, oneshot::Sender<Frame>>,
    subscriptions: HashMap<u64, mpsc::UnboundedSender<ChangeEvent>>,
}

pub struct BuxtonClient {
    next_msgid: AtomicU64,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<Mutex<Pending>>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl BuxtonClient {
    pub async fn open(socket_path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        let (mut read_half, mut write_half) = stream.into_split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = write_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let pending = Arc::new(Mutex::new(Pending {
            reply: HashMap::new(),
            subscriptions: HashMap::new(),
        }));

        let reader_pending = pending.clone();
        let reader_task = tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::with_capacity(4096);
            let mut chunk = [0u8; 4096];
            loop {
                match wire::peek_size(&buf) {
                    Ok(Some(total_len)) if buf.len() >= total_len as usize => {
                        let frame_bytes: Vec<u8> = buf.drain(..total_len as usize).collect();
                        match wire::decode(&frame_bytes, Direction::ServerToClient) {
                            Ok(frame) => dispatch_incoming(&reader_pending, frame).await,
                            Err(e) => {
                                tracing::warn!(error = ?e, "malformed reply frame");
                                return;
                            }
                        }
                    }
                    Ok(_) => match read_half.read(&mut chunk).await {
                        Ok(0) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        Err(_) => return,
                    },
                    Err(_) => return,
                }
            }
        });

        Ok(Self {
            next_msgid: AtomicU64::new(1),
            write_tx,
            pending,
            writer_task,
            reader_task,
        })
    }

    fn alloc_msgid(&self) -> u64 {
        self.next_msgid.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(&self, msg_type: MsgType, params: Vec<Param>) -> Result<Frame, ClientError> {
        let msgid = self.alloc_msgid();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.reply.insert(msgid, tx);

        let bytes = wire::encode(msg_type, msgid, &params).map_err(|_| ClientError::Malformed)?;
        self.write_tx.send(bytes).map_err(|_| ClientError::Closed)?;

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.lock().await.reply.remove(&msgid);
                Err(ClientError::Timeout)
            }
        }
    }

    fn key_params(key: &Key) -> Vec<Param> {
        vec![
            Param::unlabelled(Value::String(key.layer.clone().unwrap_or_default())),
            Param::unlabelled(Value::String(key.group.clone())),
            Param::unlabelled(Value::String(key.name.clone().unwrap_or_default())),
        ]
    }

    fn status_code(frame: &Frame) -> Result<StatusCode, ClientError> {
        match frame.params.first() {
            Some(Param { value: Value::Int32(code), .. }) => {
                StatusCode::from_i32(*code).ok_or(ClientError::Malformed)
            }
            _ => Err(ClientError::Malformed),
        }
    }

    pub async fn get(&self, key: &Key) -> Result<(Value, Label), ClientError> {
        let frame = self.request(MsgType::Get, Self::key_params(key)).await?;
        let code = Self::status_code(&frame)?;
        if !code.is_ok() {
            return Err(ClientError::Status(code));
        }
        match frame.params.get(1) {
            Some(p) => {
                let label = Label::new(String::from_utf8_lossy(&p.label).into_owned())
                    .map_err(|_| ClientError::Malformed)?;
                Ok((p.value.clone(), label))
            }
            None => Err(ClientError::Malformed),
        }
    }

    pub async fn set(&self, key: &Key, value: Value) -> Result<(), ClientError> {
        let mut params = Self::key_params(key);
        params.push(Param::unlabelled(value));
        let frame = self.request(MsgType::Set, params).await?;
        self.ack(&frame)
    }

    pub async fn unset(&self, key: &Key) -> Result<(), ClientError> {
        let frame = self.request(MsgType::Unset, Self::key_params(key)).await?;
        self.ack(&frame)
    }

    pub async fn create_group(&self, key: &Key) -> Result<(), ClientError> {
        let frame = self.request(MsgType::CreateGroup, Self::key_params(key)).await?;
        self.ack(&frame)
    }

    pub async fn remove_group(&self, key: &Key) -> Result<(), ClientError> {
        let frame = self.request(MsgType::RemoveGroup, Self::key_params(key)).await?;
        self.ack(&frame)
    }

    pub async fn set_label(&self, key: &Key, label: &Label) -> Result<(), ClientError> {
        let mut params = Self::key_params(key);
        params.push(Param::unlabelled(Value::String(label.as_str().to_string())));
        let frame = self.request(MsgType::SetLabel, params).await?;
        self.ack(&frame)
    }

    pub async fn list(&self, layer: &str) -> Result<Vec<String>, ClientError> {
        let params = vec![Param::unlabelled(Value::String(layer.to_string()))];
        let frame = self.request(MsgType::List, params).await?;
        let code = Self::status_code(&frame)?;
        if !code.is_ok() {
            return Err(ClientError::Status(code));
        }
        frame
            .params
            .iter()
            .skip(1)
            .map(|p| match &p.value {
                Value::String(s) => Ok(s.clone()),
                _ => Err(ClientError::Malformed),
            })
            .collect()
    }

    /// Subscribe to changes on `key` (a group key subscribes to the whole
    /// group). Returns the subscription id (for `unnotify`) and a channel
    /// of future `CHANGED` events.
    pub async fn notify(&self, key: &Key) -> Result<(u64, mpsc::UnboundedReceiver<ChangeEvent>), ClientError> {
        let msgid = self.alloc_msgid();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().await.subscriptions.insert(msgid, tx);

        let bytes = wire::encode(MsgType::Notify, msgid, &Self::key_params(key))
            .map_err(|_| ClientError::Malformed)?;
        self.write_tx.send(bytes).map_err(|_| ClientError::Closed)?;

        // The STATUS ack for NOTIFY carries the same msgid as the
        // subscription; wait for it on a fresh oneshot registered for
        // just this purpose.
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().await.reply.insert(msgid, ack_tx);
        let frame = match tokio::time::timeout(REQUEST_TIMEOUT, ack_rx).await {
            Ok(Ok(frame)) => frame,
            _ => {
                self.pending.lock().await.subscriptions.remove(&msgid);
                return Err(ClientError::Timeout);
            }
        };
        let code = Self::status_code(&frame)?;
        if !code.is_ok() {
            self.pending.lock().await.subscriptions.remove(&msgid);
            return Err(ClientError::Status(code));
        }
        Ok((msgid, rx))
    }

    pub async fn unnotify(&self, subscription_id: u64) -> Result<(), ClientError> {
        self.pending.lock().await.subscriptions.remove(&subscription_id);
        let frame = self
            .request_with_msgid(MsgType::Unnotify, subscription_id, Vec::new())
            .await?;
        self.ack(&frame)
    }

    async fn request_with_msgid(&self, msg_type: MsgType, msgid: u64, params: Vec<Param>) -> Result<Frame, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.reply.insert(msgid, tx);
        let bytes = wire::encode(msg_type, msgid, &params).map_err(|_| ClientError::Malformed)?;
        self.write_tx.send(bytes).map_err(|_| ClientError::Closed)?;
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.lock().await.reply.remove(&msgid);
                Err(ClientError::Timeout)
            }
        }
    }

    fn ack(&self, frame: &Frame) -> Result<(), ClientError> {
        let code = Self::status_code(frame)?;
        if code.is_ok() {
            Ok(())
        } else {
            Err(ClientError::Status(code))
        }
    }
}

impl Drop for BuxtonClient {
    fn drop(&mut self) {
        self.writer_task.abort();
        self.reader_task.abort();
    }
}

async fn dispatch_incoming(pending: &Arc<Mutex<Pending>>, frame: Frame) {
    match frame.msg_type {
        MsgType::Status => {
            let mut guard = pending.lock().await;
            if let Some(tx) = guard.reply.remove(&frame.msgid) {
                let _ = tx.send(frame);
            }
        }
        MsgType::Changed => {
            let guard = pending.lock().await;
            if let Some(tx) = guard.subscriptions.get(&frame.msgid) {
                let group = match frame.params.first() {
                    Some(Param { value: Value::String(s), .. }) => s.clone(),
                    _ => return,
                };
                let name = match frame.params.get(1) {
                    Some(Param { value: Value::String(s), .. }) if !s.is_empty() => Some(s.clone()),
                    _ => None,
                };
                let (value, label) = match frame.params.get(2) {
                    Some(p) => (
                        Some(p.value.clone()),
                        Label::new(String::from_utf8_lossy(&p.label).into_owned()).ok(),
                    ),
                    None => (None, None),
                };
                let _ = tx.send(ChangeEvent { group, name, value, label });
            }
        }
        _ => {}
    }
}
