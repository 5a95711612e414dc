//! Routes a decoded client frame to the resolver and builds the reply
//! (and any `CHANGED` fanout) as wire bytes.

use buxton_core::model::{AccessMode, Key, Value};
use buxton_core::status::StatusCode;
use buxton_core::wire::{self, Frame, MsgType, Param};
use buxton_services::{Caller, ChangeNotification, Resolver, ResolverError};

use crate::client::ClientTable;

/// A frame queued for a specific already-connected client — used for
/// `CHANGED` fanout to subscribers other than the caller.
pub struct Delivery {
    pub client_id: u64,
    pub bytes: Vec<u8>,
}

fn status_only(msgid: u64, code: StatusCode) -> Vec<u8> {
    wire::encode(MsgType::Status, msgid, &[Param::unlabelled(Value::Int32(code.as_i32()))])
        .expect("status frame always fits")
}

fn map_error(err: ResolverError) -> StatusCode {
    match err {
        ResolverError::UnknownLayer(_) | ResolverError::LayerRequired => StatusCode::BadArgs,
        ResolverError::NotFound => StatusCode::NotFound,
        ResolverError::AlreadyExists => StatusCode::EExist,
        ResolverError::Denied => StatusCode::EPerm,
        ResolverError::Backend(_) => StatusCode::Failed,
    }
}

fn string_param(frame: &Frame, index: usize) -> Result<String, StatusCode> {
    match frame.params.get(index) {
        Some(Param { value: Value::String(s), .. }) => Ok(s.clone()),
        Some(_) => Err(StatusCode::InvalidType),
        None => Err(StatusCode::BadArgs),
    }
}

fn opt_string(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Parse the `(layer, group, name)` triple carried by every
/// key-addressing request, in that param order.
fn key_triple(frame: &Frame) -> Result<Key, StatusCode> {
    let layer = opt_string(string_param(frame, 0)?);
    let group = string_param(frame, 1)?;
    let name = opt_string(string_param(frame, 2)?);
    Key::new(layer, group, name).map_err(|_| StatusCode::BadArgs)
}

fn changed_frame(n: &ChangeNotification) -> Vec<u8> {
    let mut params = vec![
        Param::unlabelled(Value::String(n.key.group.clone())),
        Param::unlabelled(Value::String(n.key.name.clone().unwrap_or_default())),
    ];
    if let (Some(value), Some(label)) = (&n.value, &n.label) {
        params.push(Param::new(label.as_bytes().to_vec(), value.clone()));
    }
    wire::encode(MsgType::Changed, n.subscription.msgid, &params).expect("changed frame always fits")
}

/// Dispatch one request frame. Returns the direct reply to send back to
/// `client_id`, plus any `CHANGED` deliveries for other subscribers.
pub fn dispatch(
    resolver: &Resolver,
    caller: &Caller,
    client_id: u64,
    clients: &ClientTable,
    frame: &Frame,
) -> (Vec<u8>, Vec<Delivery>) {
    let notifications_to_deliveries = |notifications: Vec<ChangeNotification>| -> Vec<Delivery> {
        notifications
            .into_iter()
            .filter(|n| n.subscription.client_id != client_id)
            .filter(|n| match (clients.label_of(n.subscription.client_id), &n.label) {
                (Some(subscriber_label), Some(new_label)) => resolver.access().may_access(
                    subscriber_label.as_str(),
                    new_label.as_str(),
                    AccessMode::Read,
                ),
                _ => true,
            })
            .map(|n| Delivery {
                client_id: n.subscription.client_id,
                bytes: changed_frame(&n),
            })
            .collect()
    };

    match frame.msg_type {
        MsgType::Get => match key_triple(frame) {
            Ok(key) => match resolver.get(caller, &key) {
                Ok((value, label)) => {
                    let params = vec![
                        Param::unlabelled(Value::Int32(StatusCode::Ok.as_i32())),
                        Param::new(label.as_bytes().to_vec(), value),
                    ];
                    (
                        wire::encode(MsgType::Status, frame.msgid, &params).expect("fits"),
                        Vec::new(),
                    )
                }
                Err(e) => (status_only(frame.msgid, map_error(e)), Vec::new()),
            },
            Err(code) => (status_only(frame.msgid, code), Vec::new()),
        },

        MsgType::Set => {
            let result = key_triple(frame).and_then(|key| {
                let value = frame
                    .params
                    .get(3)
                    .map(|p| p.value.clone())
                    .ok_or(StatusCode::BadArgs)?;
                Ok((key, value))
            });
            match result {
                Ok((key, value)) => match resolver.set(caller, &key, value) {
                    Ok(notifications) => (
                        status_only(frame.msgid, StatusCode::Ok),
                        notifications_to_deliveries(notifications),
                    ),
                    Err(e) => (status_only(frame.msgid, map_error(e)), Vec::new()),
                },
                Err(code) => (status_only(frame.msgid, code), Vec::new()),
            }
        }

        MsgType::Unset => match key_triple(frame) {
            Ok(key) => match resolver.unset(caller, &key) {
                Ok(notifications) => (
                    status_only(frame.msgid, StatusCode::Ok),
                    notifications_to_deliveries(notifications),
                ),
                Err(e) => (status_only(frame.msgid, map_error(e)), Vec::new()),
            },
            Err(code) => (status_only(frame.msgid, code), Vec::new()),
        },

        MsgType::CreateGroup => match key_triple(frame) {
            Ok(key) => match resolver.create_group(caller, &key) {
                Ok(notifications) => (
                    status_only(frame.msgid, StatusCode::Ok),
                    notifications_to_deliveries(notifications),
                ),
                Err(e) => (status_only(frame.msgid, map_error(e)), Vec::new()),
            },
            Err(code) => (status_only(frame.msgid, code), Vec::new()),
        },

        MsgType::RemoveGroup => match key_triple(frame) {
            Ok(key) => match resolver.remove_group(caller, &key) {
                Ok(notifications) => (
                    status_only(frame.msgid, StatusCode::Ok),
                    notifications_to_deliveries(notifications),
                ),
                Err(e) => (status_only(frame.msgid, map_error(e)), Vec::new()),
            },
            Err(code) => (status_only(frame.msgid, code), Vec::new()),
        },

        MsgType::SetLabel => {
            let result = key_triple(frame).and_then(|key| {
                let label_str = string_param(frame, 3)?;
                let label = buxton_core::model::Label::new(label_str).map_err(|_| StatusCode::BadArgs)?;
                Ok((key, label))
            });
            match result {
                Ok((key, label)) => match resolver.set_label(caller, &key, label) {
                    Ok(notifications) => (
                        status_only(frame.msgid, StatusCode::Ok),
                        notifications_to_deliveries(notifications),
                    ),
                    Err(e) => (status_only(frame.msgid, map_error(e)), Vec::new()),
                },
                Err(code) => (status_only(frame.msgid, code), Vec::new()),
            }
        }

        MsgType::List => match string_param(frame, 0) {
            Ok(layer_name) => match resolver.list(caller, &layer_name) {
                Ok(keys) => {
                    let mut params = vec![Param::unlabelled(Value::Int32(StatusCode::Ok.as_i32()))];
                    params.extend(keys.into_iter().map(|k| {
                        let formatted = match k.name {
                            Some(name) => format!("{}/{}", k.group, name),
                            None => k.group,
                        };
                        Param::unlabelled(Value::String(formatted))
                    }));
                    (wire::encode(MsgType::Status, frame.msgid, &params).expect("fits"), Vec::new())
                }
                Err(e) => (status_only(frame.msgid, map_error(e)), Vec::new()),
            },
            Err(code) => (status_only(frame.msgid, code), Vec::new()),
        },

        MsgType::Notify => match key_triple(frame) {
            Ok(key) => {
                resolver.subscribe(&key, client_id, frame.msgid);
                (status_only(frame.msgid, StatusCode::Ok), Vec::new())
            }
            Err(code) => (status_only(frame.msgid, code), Vec::new()),
        },

        MsgType::Unnotify => {
            let removed = resolver.unsubscribe(client_id, frame.msgid);
            let code = if removed { StatusCode::Ok } else { StatusCode::ENoEnt };
            (status_only(frame.msgid, code), Vec::new())
        }

        MsgType::Status | MsgType::Changed => {
            (status_only(frame.msgid, StatusCode::InvalidControlField), Vec::new())
        }
    }
}
