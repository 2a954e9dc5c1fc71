//! Share one computed method result between two linked nodes.
//!
//! Both nodes enter the same method; one computes the result and publishes
//! it, the other waits for it instead of computing its own. Each proxy gets a
//! correlation id built from the remote id, the method name and a per-method
//! call number, so two nodes that call in lockstep agree on it without
//! coordinating.

use crate::cancel::{with_cancellation, Cancellation};
use crate::error::{RemoteError, RemoteResult};
use crate::handler::MessageHandler;
use crate::member::Remotable;
use crate::member_remote::MemberRemote;
use crate::message::{MessageBody, RemoteId, RemoteMessage};
use crate::value::{decode_as, to_value, ConverterRegistry, RemoteValue};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Most nodes that may share one proxied result.
pub const MAX_PARTICIPANTS: usize = 2;

pub struct RemoteMethodProxy {
    id: RemoteId,
    method_name: String,
    correlation_id: String,
    handler: Arc<dyn MessageHandler>,
    converters: ConverterRegistry,
}

impl RemoteMethodProxy {
    /// Prepares the next proxied call of `method_name` on `remote`.
    ///
    /// Fails with [`RemoteError::TooManyParticipants`] when the handler
    /// reports more than one linked peer. Peers are counted per transport,
    /// so nodes serving other remote ids on the same bus count too; give
    /// proxied pairs a transport of their own.
    pub fn new<T: Remotable>(method_name: &str, remote: &MemberRemote<T>) -> RemoteResult<Self> {
        let handler = Arc::clone(remote.handler());
        if let Some(peers) = handler.linked_peers() {
            let participants = peers + 1;
            if participants > MAX_PARTICIPANTS {
                return Err(RemoteError::TooManyParticipants { participants });
            }
        }

        let sequence = remote.next_call_sequence(method_name);
        let correlation_id = format!("{}.MethodCall.{}.{}", remote.id(), method_name, sequence);
        Ok(Self {
            id: remote.id().clone(),
            method_name: method_name.to_string(),
            correlation_id,
            handler,
            converters: remote.converters().clone(),
        })
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Shares `value` with the peer and returns it.
    pub async fn publish_result<V: RemoteValue>(
        &self,
        value: V,
        cancel: Option<&Cancellation>,
    ) -> RemoteResult<V> {
        let message = RemoteMessage::targeted(
            self.id.clone(),
            MessageBody::MethodProxy {
                correlation_id: self.correlation_id.clone(),
                method_name: self.method_name.clone(),
                result: to_value(&value)?,
            },
        );
        let bytes = self.handler.codec().encode(&message)?;
        self.handler.ensure_connected().await?;
        self.handler.send_raw(bytes, cancel).await?;
        tracing::debug!(
            remote_id = %self.id,
            correlation_id = %self.correlation_id,
            "method result published"
        );
        Ok(value)
    }

    /// Starts waiting for the peer's result. Subscribes before returning.
    pub fn receive_result<V: RemoteValue>(
        &self,
        cancel: Option<Cancellation>,
    ) -> impl Future<Output = RemoteResult<V>> + Send + 'static {
        let inbound = self.handler.subscribe();
        let correlation_id = self.correlation_id.clone();
        let converters = self.converters.clone();
        async move {
            with_cancellation(cancel.as_ref(), next_result(inbound, correlation_id, converters)).await?
        }
    }
}

impl std::fmt::Debug for RemoteMethodProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMethodProxy")
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

async fn next_result<V: RemoteValue>(
    mut inbound: broadcast::Receiver<RemoteMessage>,
    correlation_id: String,
    converters: ConverterRegistry,
) -> RemoteResult<V> {
    loop {
        let message = match inbound.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(%correlation_id, skipped, "method proxy receiver lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Err(RemoteError::ChannelClosed),
        };
        if let MessageBody::MethodProxy {
            correlation_id: received,
            result,
            ..
        } = message.body
        {
            if received == correlation_id {
                return Ok(decode_as(result, &converters)?);
            }
        }
    }
}
