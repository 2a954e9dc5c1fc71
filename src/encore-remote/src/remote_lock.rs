//! Distributed wait/release on top of data messages.
//!
//! Waits are keyed by `"{remote_id}.{token}.RemoteLock"` in a process-wide
//! registry. Every local waiter on the same key shares one pending release,
//! and a single release message from a linked node resolves all of them.

use crate::cancel::{with_cancellation, Cancellation};
use crate::error::{RemoteError, RemoteResult};
use crate::member::Remotable;
use crate::member_remote::MemberRemote;
use crate::message::{MessageBody, RemoteId, RemoteMessage};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};

const LOCK_SIGNATURE: &str = "RemoteLock";

struct PendingRelease {
    released: watch::Sender<bool>,
}

static PENDING: Mutex<BTreeMap<String, Arc<PendingRelease>>> = Mutex::new(BTreeMap::new());

fn pending() -> MutexGuard<'static, BTreeMap<String, Arc<PendingRelease>>> {
    PENDING.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn scoped_token(id: &RemoteId, token: &str) -> String {
    format!("{id}.{token}.{LOCK_SIGNATURE}")
}

/// Waits until a linked node releases `token`.
///
/// Registration happens before this returns: callers that start waiting on
/// the same token join the pending release already registered. Without
/// `cancel` the wait has no timeout.
pub fn remote_wait<T: Remotable>(
    remote: &MemberRemote<T>,
    token: &str,
    cancel: Option<Cancellation>,
) -> impl Future<Output = RemoteResult<()>> + Send + 'static {
    let registered = register(remote, &scoped_token(remote.id(), token));
    async move {
        let mut released = registered?;
        with_cancellation(cancel.as_ref(), async move {
            released
                .wait_for(|released| *released)
                .await
                .map(|_| ())
                .map_err(|_| RemoteError::ChannelClosed)
        })
        .await?
    }
}

/// Releases every waiter on `token` at the linked nodes.
pub async fn remote_release<T: Remotable>(
    remote: &MemberRemote<T>,
    token: &str,
    cancel: Option<Cancellation>,
) -> RemoteResult<()> {
    let scoped = scoped_token(remote.id(), token);
    let message = RemoteMessage::targeted(
        remote.id().clone(),
        MessageBody::Data {
            token: scoped.clone(),
            signature: LOCK_SIGNATURE.to_string(),
            payload: Value::Null,
        },
    );
    let handler = remote.handler();
    handler.ensure_connected().await?;
    handler.send(message, cancel.as_ref()).await?;
    tracing::debug!(remote_id = %remote.id(), token = %scoped, "remote lock released");
    Ok(())
}

/// Local callers currently waiting on `token`.
pub fn waiter_count<T: Remotable>(remote: &MemberRemote<T>, token: &str) -> usize {
    pending()
        .get(&scoped_token(remote.id(), token))
        .map_or(0, |entry| entry.released.receiver_count())
}

pub fn is_pending<T: Remotable>(remote: &MemberRemote<T>, token: &str) -> bool {
    pending().contains_key(&scoped_token(remote.id(), token))
}

fn register<T: Remotable>(remote: &MemberRemote<T>, scoped: &str) -> RemoteResult<watch::Receiver<bool>> {
    let mut registry = pending();
    if let Some(entry) = registry.get(scoped) {
        tracing::debug!(token = scoped, "joining pending remote lock");
        return Ok(entry.released.subscribe());
    }

    let runtime = tokio::runtime::Handle::try_current().map_err(|_| RemoteError::NoRuntime)?;
    let (released, waiter) = watch::channel(false);
    let entry = Arc::new(PendingRelease { released });
    registry.insert(scoped.to_string(), Arc::clone(&entry));
    runtime.spawn(listen(
        entry,
        remote.handler().subscribe(),
        remote.id().clone(),
        scoped.to_string(),
    ));
    tracing::debug!(token = scoped, "remote lock registered");
    Ok(waiter)
}

/// Drops the registry entry if it is still `entry`.
fn remove(scoped: &str, entry: &Arc<PendingRelease>) {
    let mut registry = pending();
    if registry
        .get(scoped)
        .is_some_and(|current| Arc::ptr_eq(current, entry))
    {
        registry.remove(scoped);
    }
}

async fn listen(
    entry: Arc<PendingRelease>,
    mut inbound: broadcast::Receiver<RemoteMessage>,
    id: RemoteId,
    scoped: String,
) {
    loop {
        tokio::select! {
            received = inbound.recv() => match received {
                Ok(message) if is_release(&message, &id, &scoped) => {
                    remove(&scoped, &entry);
                    entry.released.send_replace(true);
                    tracing::debug!(token = %scoped, "remote lock release received");
                    return;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(token = %scoped, skipped, "remote lock listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    remove(&scoped, &entry);
                    tracing::debug!(token = %scoped, "inbound closed, remote lock abandoned");
                    return;
                }
            },
            _ = entry.released.closed() => {
                // A new waiter may have joined between the last drop and here.
                let mut registry = pending();
                if entry.released.receiver_count() == 0 {
                    if registry.get(&scoped).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                        registry.remove(&scoped);
                    }
                    tracing::debug!(token = %scoped, "remote lock has no waiters left");
                    return;
                }
            }
        }
    }
}

fn is_release(message: &RemoteMessage, id: &RemoteId, scoped: &str) -> bool {
    message.target.as_ref() == Some(id)
        && matches!(&message.body, MessageBody::Data { token, .. } if token == scoped)
}
