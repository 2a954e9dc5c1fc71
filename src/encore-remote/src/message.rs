//! Remote message shapes.
//!
//! These are transport-neutral; a [`MessageCodec`](crate::handler::MessageCodec)
//! turns them into bytes for whatever carries them between nodes.

use crate::value::ValueType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Stable cross-node identity of a member remote. Remotes on different nodes
/// are linked when their ids are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteId(pub String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RemoteId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RemoteId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RemoteId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Envelope for everything exchanged between linked remotes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    /// Member remote the message is addressed to; `None` reaches every remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<RemoteId>,
    pub body: MessageBody,
}

/// A method argument paired with the type the sender declared for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub value_type: ValueType,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    /// A remoted method was entered on the sending node.
    MethodCall {
        signature: String,
        arguments: Vec<Argument>,
    },
    /// A remoted property was assigned on the sending node.
    PropertyChange {
        signature: String,
        old_value: Value,
        new_value: Value,
    },
    /// Free-form, token-correlated payload.
    Data {
        token: String,
        signature: String,
        payload: Value,
    },
    /// A method result computed once and shared with the peer.
    MethodProxy {
        correlation_id: String,
        method_name: String,
        result: Value,
    },
    /// A remoted method failed on the sending node.
    Exception {
        message: String,
        stack_trace: String,
        signature: String,
    },
}

impl RemoteMessage {
    pub fn targeted(target: RemoteId, body: MessageBody) -> Self {
        Self {
            target: Some(target),
            body,
        }
    }

    pub fn untargeted(body: MessageBody) -> Self {
        Self { target: None, body }
    }

    /// Whether a remote with `id` should look at this message at all.
    pub fn targets(&self, id: &RemoteId) -> bool {
        self.target.as_ref().map_or(true, |target| target == id)
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            MessageBody::MethodCall { .. } => "method_call",
            MessageBody::PropertyChange { .. } => "property_change",
            MessageBody::Data { .. } => "data",
            MessageBody::MethodProxy { .. } => "method_proxy",
            MessageBody::Exception { .. } => "exception",
        }
    }

    /// Member signature carried by the message, if any.
    pub fn signature(&self) -> Option<&str> {
        match &self.body {
            MessageBody::MethodCall { signature, .. }
            | MessageBody::PropertyChange { signature, .. }
            | MessageBody::Data { signature, .. }
            | MessageBody::Exception { signature, .. } => Some(signature),
            MessageBody::MethodProxy { .. } => None,
        }
    }
}
