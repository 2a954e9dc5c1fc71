//! Token-correlated data exchange between linked remotes.
//!
//! One side publishes a value under a token; the other waits for the first
//! data message carrying that token for the same remote id. Payloads are
//! reconciled with the remote's converters, so a custom converter registered
//! for a named type applies here too.

use crate::cancel::{with_cancellation, Cancellation};
use crate::error::{RemoteError, RemoteResult};
use crate::member::Remotable;
use crate::member_remote::MemberRemote;
use crate::message::{MessageBody, RemoteId, RemoteMessage};
use crate::value::{decode_as, to_value, ConverterRegistry, RemoteValue};
use std::future::Future;
use tokio::sync::broadcast;

/// Starts waiting for a value published under `token`.
///
/// The subscription is taken before this returns, so a publish issued after
/// the call is never missed even if the returned future is polled later.
/// Without `cancel` the wait has no timeout.
pub fn receive_data<T, V>(
    remote: &MemberRemote<T>,
    token: impl Into<String>,
    cancel: Option<Cancellation>,
) -> impl Future<Output = RemoteResult<V>> + Send + 'static
where
    T: Remotable,
    V: RemoteValue,
{
    let inbound = remote.handler().subscribe();
    let id = remote.id().clone();
    let converters = remote.converters().clone();
    let token = token.into();
    async move {
        with_cancellation(cancel.as_ref(), next_payload(inbound, id, token, converters)).await?
    }
}

/// Sends `value` to every linked remote under `token` and hands it back.
pub async fn publish_data<T, V>(
    remote: &MemberRemote<T>,
    value: V,
    token: impl Into<String>,
    cancel: Option<Cancellation>,
) -> RemoteResult<V>
where
    T: Remotable,
    V: RemoteValue,
{
    let token = token.into();
    let message = RemoteMessage::targeted(
        remote.id().clone(),
        MessageBody::Data {
            token: token.clone(),
            signature: V::value_type().to_string(),
            payload: to_value(&value)?,
        },
    );

    let handler = remote.handler();
    handler.ensure_connected().await?;
    handler.send(message, cancel.as_ref()).await?;
    tracing::debug!(remote_id = %remote.id(), %token, "data published");
    Ok(value)
}

async fn next_payload<V: RemoteValue>(
    mut inbound: broadcast::Receiver<RemoteMessage>,
    id: RemoteId,
    token: String,
    converters: ConverterRegistry,
) -> RemoteResult<V> {
    loop {
        let message = match inbound.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(remote_id = %id, %token, skipped, "data receiver lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Err(RemoteError::ChannelClosed),
        };
        if message.target.as_ref() != Some(&id) {
            continue;
        }
        if let MessageBody::Data {
            token: received,
            payload,
            ..
        } = message.body
        {
            if received == token {
                tracing::debug!(remote_id = %id, %token, "data received");
                return Ok(decode_as(payload, &converters)?);
            }
        }
    }
}
