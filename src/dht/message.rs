use bytes::Bytes;
use rand::Rng as _;
use std::collections::BTreeMap;

use super::bits::Bitmap;
use super::contact::Contact;
use super::error::DhtError;
use crate::bencode::{decode, encode, Value};
use crate::constants::MESSAGE_ID_LENGTH;

/// Random per-request correlation id, chosen by the requester and echoed
/// back in the response or error frame.
pub type MessageId = [u8; MESSAGE_ID_LENGTH];

pub fn new_message_id() -> MessageId {
    let mut id = [0u8; MESSAGE_ID_LENGTH];
    rand::rng().fill(&mut id[..]);
    id
}

const FRAME_REQUEST: i64 = 0;
const FRAME_RESPONSE: i64 = 1;
const FRAME_ERROR: i64 = 2;

// Frame fields are a bencoded dict keyed by ASCII digits.
const KEY_TYPE: &[u8] = b"0";
const KEY_MESSAGE_ID: &[u8] = b"1";
const KEY_NODE_ID: &[u8] = b"2";
const KEY_PAYLOAD: &[u8] = b"3";
const KEY_ARGS: &[u8] = b"4";

const METHOD_PING: &str = "ping";
const METHOD_STORE: &str = "store";
const METHOD_FIND_NODE: &str = "findNode";
const METHOD_FIND_VALUE: &str = "findValue";

/// An RPC request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    /// Record that some node holds `blob_hash`. The announced contact is the
    /// sender itself when `self_store` is set, otherwise `{node_id,
    /// sender_ip, port}` — a node announcing the blob-download port of a
    /// peer it fronts for.
    Store {
        blob_hash: Bitmap,
        token: Bytes,
        port: u16,
        node_id: Bitmap,
        self_store: bool,
    },
    FindNode {
        target: Bitmap,
    },
    FindValue {
        blob_hash: Bitmap,
    },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Ping => METHOD_PING,
            Request::Store { .. } => METHOD_STORE,
            Request::FindNode { .. } => METHOD_FIND_NODE,
            Request::FindValue { .. } => METHOD_FIND_VALUE,
        }
    }
}

/// An RPC response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    /// Reply to `ping`.
    Pong,
    /// Reply to a successful `store`.
    StoreOk,
    /// Reply to `findNode`: up to k contacts closest to the target.
    Contacts(Vec<Contact>),
    /// Reply to `findValue` when nothing is stored for the hash: closest
    /// contacts plus a token the requester can later `store` with.
    CloserContacts { contacts: Vec<Contact>, token: Bytes },
    /// Reply to `findValue` when the hash is known: the announcing
    /// contacts, keyed by the hash itself on the wire.
    Value {
        blob_hash: Bitmap,
        contacts: Vec<Contact>,
        token: Bytes,
    },
}

/// A wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request {
        message_id: MessageId,
        node_id: Bitmap,
        request: Request,
    },
    Response {
        message_id: MessageId,
        node_id: Bitmap,
        payload: ResponsePayload,
    },
    Error {
        message_id: MessageId,
        node_id: Bitmap,
        code: i64,
        text: String,
        extra: Vec<Bytes>,
    },
}

impl Message {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Message::Request { message_id, .. }
            | Message::Response { message_id, .. }
            | Message::Error { message_id, .. } => message_id,
        }
    }

    pub fn node_id(&self) -> &Bitmap {
        match self {
            Message::Request { node_id, .. }
            | Message::Response { node_id, .. }
            | Message::Error { node_id, .. } => node_id,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| malformed("frame is not a dict"))?;

        let frame_type = dict
            .get(KEY_TYPE)
            .and_then(|v| v.as_integer())
            .ok_or_else(|| malformed("missing frame type"))?;

        let message_id = message_id_field(dict)?;
        let node_id = node_id_field(dict)?;

        match frame_type {
            FRAME_REQUEST => parse_request(message_id, node_id, dict),
            FRAME_RESPONSE => parse_response(message_id, node_id, dict),
            FRAME_ERROR => parse_error(message_id, node_id, dict),
            other => Err(malformed(&format!("unknown frame type {}", other))),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();

        match self {
            Message::Request {
                message_id,
                node_id,
                request,
            } => {
                dict.insert(key(KEY_TYPE), Value::Integer(FRAME_REQUEST));
                dict.insert(key(KEY_MESSAGE_ID), bytes_value(message_id));
                dict.insert(key(KEY_NODE_ID), bytes_value(node_id.as_bytes()));
                dict.insert(key(KEY_PAYLOAD), Value::string(request.method()));
                dict.insert(key(KEY_ARGS), encode_args(request));
            }
            Message::Response {
                message_id,
                node_id,
                payload,
            } => {
                dict.insert(key(KEY_TYPE), Value::Integer(FRAME_RESPONSE));
                dict.insert(key(KEY_MESSAGE_ID), bytes_value(message_id));
                dict.insert(key(KEY_NODE_ID), bytes_value(node_id.as_bytes()));
                dict.insert(key(KEY_PAYLOAD), encode_payload(payload));
            }
            Message::Error {
                message_id,
                node_id,
                code,
                text,
                extra,
            } => {
                dict.insert(key(KEY_TYPE), Value::Integer(FRAME_ERROR));
                dict.insert(key(KEY_MESSAGE_ID), bytes_value(message_id));
                dict.insert(key(KEY_NODE_ID), bytes_value(node_id.as_bytes()));

                let mut fields = vec![Value::Integer(*code), Value::string(text)];
                fields.extend(extra.iter().cloned().map(Value::Bytes));
                dict.insert(key(KEY_ARGS), Value::List(fields));
            }
        }

        encode(&Value::Dict(dict))
    }
}

fn malformed(what: &str) -> DhtError {
    DhtError::MalformedMessage(what.to_string())
}

fn key(k: &[u8]) -> Bytes {
    Bytes::copy_from_slice(k)
}

fn bytes_value(b: &[u8]) -> Value {
    Value::Bytes(Bytes::copy_from_slice(b))
}

fn message_id_field(dict: &BTreeMap<Bytes, Value>) -> Result<MessageId, DhtError> {
    let raw = dict
        .get(KEY_MESSAGE_ID)
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| malformed("missing message id"))?;

    if raw.len() != MESSAGE_ID_LENGTH {
        return Err(malformed("message id is not 20 bytes"));
    }

    let mut id = [0u8; MESSAGE_ID_LENGTH];
    id.copy_from_slice(raw);
    Ok(id)
}

fn node_id_field(dict: &BTreeMap<Bytes, Value>) -> Result<Bitmap, DhtError> {
    let raw = dict
        .get(KEY_NODE_ID)
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| malformed("missing node id"))?;
    Bitmap::from_bytes(raw)
}

fn parse_request(
    message_id: MessageId,
    node_id: Bitmap,
    dict: &BTreeMap<Bytes, Value>,
) -> Result<Message, DhtError> {
    let method = dict
        .get(KEY_PAYLOAD)
        .and_then(|v| v.as_str())
        .ok_or_else(|| malformed("missing method name"))?;

    let args = dict
        .get(KEY_ARGS)
        .and_then(|v| v.as_list())
        .ok_or_else(|| malformed("missing argument list"))?;

    let request = match method {
        METHOD_PING => Request::Ping,
        METHOD_FIND_NODE => Request::FindNode {
            target: id_arg(args, 0)?,
        },
        METHOD_FIND_VALUE => Request::FindValue {
            blob_hash: id_arg(args, 0)?,
        },
        METHOD_STORE => parse_store_args(args)?,
        other => return Err(malformed(&format!("unknown method {:?}", other))),
    };

    Ok(Message::Request {
        message_id,
        node_id,
        request,
    })
}

fn id_arg(args: &[Value], index: usize) -> Result<Bitmap, DhtError> {
    let raw = args
        .get(index)
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| malformed("missing id argument"))?;
    Bitmap::from_bytes(raw)
}

fn parse_store_args(args: &[Value]) -> Result<Request, DhtError> {
    let blob_hash = id_arg(args, 0)?;

    let fields = args
        .get(1)
        .and_then(|v| v.as_dict())
        .ok_or_else(|| malformed("store args missing field dict"))?;

    let token = fields
        .get(b"token".as_slice())
        .and_then(|v| v.as_bytes())
        .cloned()
        .ok_or_else(|| malformed("store args missing token"))?;

    let port = fields
        .get(b"port".as_slice())
        .and_then(|v| v.as_integer())
        .filter(|p| (0..=i64::from(u16::MAX)).contains(p))
        .ok_or_else(|| malformed("store args missing port"))? as u16;

    let node_id = fields
        .get(b"lbryid".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| malformed("store args missing lbryid"))
        .and_then(|raw| Bitmap::from_bytes(raw))?;

    let self_store = fields
        .get(b"selfStore".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v != 0)
        .unwrap_or(false);

    Ok(Request::Store {
        blob_hash,
        token,
        port,
        node_id,
        self_store,
    })
}

fn parse_response(
    message_id: MessageId,
    node_id: Bitmap,
    dict: &BTreeMap<Bytes, Value>,
) -> Result<Message, DhtError> {
    let payload = dict
        .get(KEY_PAYLOAD)
        .ok_or_else(|| malformed("missing response payload"))?;

    let payload = match payload {
        Value::Bytes(b) if b.as_ref() == b"pong" => ResponsePayload::Pong,
        Value::Bytes(b) if b.as_ref() == b"0" => ResponsePayload::StoreOk,
        Value::Bytes(_) => return Err(malformed("unknown response literal")),
        Value::List(items) => ResponsePayload::Contacts(contacts_from_list(items)?),
        Value::Dict(entries) => parse_find_value_payload(entries)?,
        Value::Integer(_) => return Err(malformed("integer response payload")),
    };

    Ok(Message::Response {
        message_id,
        node_id,
        payload,
    })
}

fn parse_find_value_payload(
    entries: &BTreeMap<Bytes, Value>,
) -> Result<ResponsePayload, DhtError> {
    let token = entries
        .get(b"token".as_slice())
        .and_then(|v| v.as_bytes())
        .cloned()
        .unwrap_or_default();

    if let Some(list) = entries.get(b"contacts".as_slice()) {
        let items = list
            .as_list()
            .ok_or_else(|| malformed("contacts is not a list"))?;
        return Ok(ResponsePayload::CloserContacts {
            contacts: contacts_from_list(items)?,
            token,
        });
    }

    // The value branch keys the contact list by the blob hash itself.
    for (k, v) in entries {
        if let Ok(blob_hash) = Bitmap::from_bytes(k) {
            let items = v
                .as_list()
                .ok_or_else(|| malformed("value contacts is not a list"))?;
            return Ok(ResponsePayload::Value {
                blob_hash,
                contacts: contacts_from_list(items)?,
                token,
            });
        }
    }

    Err(malformed("findValue payload has neither branch"))
}

fn parse_error(
    message_id: MessageId,
    node_id: Bitmap,
    dict: &BTreeMap<Bytes, Value>,
) -> Result<Message, DhtError> {
    let fields = dict
        .get(KEY_ARGS)
        .and_then(|v| v.as_list())
        .ok_or_else(|| malformed("missing error fields"))?;

    let code = fields.first().and_then(|v| v.as_integer()).unwrap_or(0);
    let text = fields
        .get(1)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error")
        .to_string();
    let extra = fields
        .iter()
        .skip(2)
        .filter_map(|v| v.as_bytes().cloned())
        .collect();

    Ok(Message::Error {
        message_id,
        node_id,
        code,
        text,
        extra,
    })
}

fn encode_args(request: &Request) -> Value {
    match request {
        Request::Ping => Value::List(Vec::new()),
        Request::FindNode { target } => Value::List(vec![bytes_value(target.as_bytes())]),
        Request::FindValue { blob_hash } => Value::List(vec![bytes_value(blob_hash.as_bytes())]),
        Request::Store {
            blob_hash,
            token,
            port,
            node_id,
            self_store,
        } => {
            let mut fields = BTreeMap::new();
            fields.insert(key(b"token"), Value::Bytes(token.clone()));
            fields.insert(key(b"port"), Value::Integer(i64::from(*port)));
            fields.insert(key(b"lbryid"), bytes_value(node_id.as_bytes()));
            if *self_store {
                fields.insert(key(b"selfStore"), Value::Integer(1));
            }

            Value::List(vec![bytes_value(blob_hash.as_bytes()), Value::Dict(fields)])
        }
    }
}

fn encode_payload(payload: &ResponsePayload) -> Value {
    match payload {
        ResponsePayload::Pong => Value::string("pong"),
        ResponsePayload::StoreOk => Value::string("0"),
        ResponsePayload::Contacts(contacts) => Value::List(contacts_to_values(contacts)),
        ResponsePayload::CloserContacts { contacts, token } => {
            let mut entries = BTreeMap::new();
            entries.insert(key(b"contacts"), Value::List(contacts_to_values(contacts)));
            entries.insert(key(b"token"), Value::Bytes(token.clone()));
            Value::Dict(entries)
        }
        ResponsePayload::Value {
            blob_hash,
            contacts,
            token,
        } => {
            let mut entries = BTreeMap::new();
            entries.insert(
                key(blob_hash.as_bytes()),
                Value::List(contacts_to_values(contacts)),
            );
            entries.insert(key(b"token"), Value::Bytes(token.clone()));
            Value::Dict(entries)
        }
    }
}

fn contacts_to_values(contacts: &[Contact]) -> Vec<Value> {
    contacts
        .iter()
        .map(|c| bytes_value(&c.to_compact()))
        .collect()
}

fn contacts_from_list(items: &[Value]) -> Result<Vec<Contact>, DhtError> {
    items
        .iter()
        .map(|v| {
            let raw = v
                .as_bytes()
                .ok_or_else(|| malformed("contact is not a byte string"))?;
            Contact::from_compact(raw)
        })
        .collect()
}
