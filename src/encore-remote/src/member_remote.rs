//! Binds one local instance to its remote peers.
//!
//! A [`MemberRemote`] owns a local [`Remotable`] instance, a stable
//! [`RemoteId`] and a [`MessageHandler`]. Member activity reported through
//! the instance's interceptor becomes outbound messages; inbound messages
//! addressed to the same id are matched to local members by signature and
//! applied.
//!
//! # Usage
//!
//! ```rust,ignore
//! let bus = MemoryBus::new();
//! let host = MemberRemote::attach(
//!     Arc::new(NowPlaying::default()),
//!     "now-playing",
//!     Some(bus.handler(RemotingMode::HOST)),
//!     RemoteOptions::default(),
//! )
//! .await?;
//! host.instance().set_volume(0.4); // reaches every linked client
//! ```

use crate::error::{RemoteError, RemoteResult};
use crate::expectancy::{self, ExpectancyGuard};
use crate::handler::{default_handler, MessageHandler};
use crate::member::{
    error_chain, Apply, Arguments, InterceptSink, InvokeError, MemberDef, MemberKind, Remotable,
};
use crate::message::{Argument, MessageBody, RemoteId, RemoteMessage};
use crate::signature::{member_signature, MemberShape, TypeIdentity};
use crate::value::{reconcile, ConversionError, ConverterRegistry};
use encore_core::{RemotingConfig, RemotingDirection, RemotingMode, SignatureScope};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Per-remote settings.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub signature_scope: SignatureScope,
    /// Inbound messages naming an unknown member fail instead of being logged.
    pub strict_signatures: bool,
    pub event_capacity: usize,
    pub converters: ConverterRegistry,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self::from(&RemotingConfig::default())
    }
}

impl From<&RemotingConfig> for RemoteOptions {
    fn from(config: &RemotingConfig) -> Self {
        Self {
            signature_scope: config.signature_scope,
            strict_signatures: config.strict_signatures,
            event_capacity: config.event_capacity.max(1),
            converters: ConverterRegistry::default(),
        }
    }
}

impl RemoteOptions {
    pub fn with_converters(mut self, converters: ConverterRegistry) -> Self {
        self.converters = converters;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_signatures = strict;
        self
    }

    pub fn scope(mut self, scope: SignatureScope) -> Self {
        self.signature_scope = scope;
        self
    }
}

/// Notifications raised by a member remote.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    /// An outbound message left through the handler.
    Sent(RemoteMessage),
    /// An inbound message was applied.
    Received(RemoteMessage),
    /// A linked peer reported a failure inside a remoted method.
    RemoteException {
        message: String,
        stack_trace: String,
        signature: String,
    },
    /// Processing or sending a message failed locally.
    Failed {
        signature: Option<String>,
        error: String,
    },
}

/// Verdict of a message filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handling {
    Continue,
    /// The filter consumed the message; no further processing happens.
    Handled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Addressed to a different member remote.
    OtherTarget,
    /// Data and method-proxy traffic belongs to the proxies.
    NotMemberMessage,
    /// The member's direction does not allow inbound changes in this mode.
    DirectionDenied,
}

/// What [`MemberRemote::process`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Ignored(IgnoreReason),
    /// A message filter consumed it.
    Handled,
    Applied { signature: String },
    /// A peer exception was surfaced as an event.
    Observed { signature: String },
    /// No local member has this signature (lenient mode only).
    UnknownMember { signature: String },
}

/// Public view of a bound member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub name: String,
    pub signature: String,
    pub kind: MemberKind,
    pub direction: Option<RemotingDirection>,
}

type MessageFilter = Arc<dyn Fn(&RemoteMessage) -> Handling + Send + Sync>;

struct BoundMember<T> {
    def: MemberDef<T>,
    signature: String,
    /// Resolved tag; `None` disables remoting for the member.
    direction: Option<RemotingDirection>,
}

struct RemoteCore<T: Remotable> {
    id: RemoteId,
    instance: Arc<T>,
    instance_key: usize,
    handler: Arc<dyn MessageHandler>,
    owner: TypeIdentity,
    members: Vec<BoundMember<T>>,
    options: RemoteOptions,
    events: broadcast::Sender<RemoteEvent>,
    filters: RwLock<Vec<MessageFilter>>,
    outbound: mpsc::UnboundedSender<RemoteMessage>,
    call_sequences: Mutex<HashMap<String, u64>>,
}

/// Keeps the tagged members of one local instance in sync with its peers.
pub struct MemberRemote<T: Remotable> {
    core: Arc<RemoteCore<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Remotable> MemberRemote<T> {
    /// Binds `instance` to peers sharing `id`.
    ///
    /// Falls back to the process-wide default handler when `handler` is
    /// `None`. The handler is connected before this returns.
    pub async fn attach(
        instance: Arc<T>,
        id: impl Into<RemoteId>,
        handler: Option<Arc<dyn MessageHandler>>,
        options: RemoteOptions,
    ) -> RemoteResult<Self> {
        let handler = handler.or_else(default_handler).ok_or(RemoteError::NoHandler)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RemoteError::NoRuntime)?;
        let id = id.into();

        let (owner, type_direction, defs) = T::members().into_parts();
        let members: Vec<BoundMember<T>> = defs
            .into_iter()
            .map(|def| bind(def, &owner, type_direction, options.signature_scope))
            .collect();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let instance_key = Arc::as_ptr(&instance) as *const () as usize;

        let core = Arc::new(RemoteCore {
            id,
            instance,
            instance_key,
            handler,
            owner,
            members,
            options,
            events,
            filters: RwLock::new(Vec::new()),
            outbound,
            call_sequences: Mutex::new(HashMap::new()),
        });

        let sink: Arc<dyn InterceptSink> = core.clone();
        core.instance.interceptor().attach(Arc::downgrade(&sink))?;

        let inbound = core.handler.subscribe();
        if let Err(err) = core.handler.ensure_connected().await {
            core.detach();
            return Err(err);
        }

        let tasks = vec![
            runtime.spawn(inbound_loop(Arc::clone(&core), inbound)),
            runtime.spawn(outbound_pump(Arc::clone(&core), outbound_rx)),
        ];

        tracing::debug!(
            remote_id = %core.id,
            owner = %core.owner,
            members = core.members.len(),
            mode = ?core.handler.mode(),
            "member remote attached"
        );

        Ok(Self {
            core,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn id(&self) -> &RemoteId {
        &self.core.id
    }

    pub fn instance(&self) -> &Arc<T> {
        &self.core.instance
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.core.handler
    }

    pub fn mode(&self) -> RemotingMode {
        self.core.handler.mode()
    }

    pub fn converters(&self) -> &ConverterRegistry {
        &self.core.options.converters
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.core
            .members
            .iter()
            .map(|m| MemberInfo {
                name: m.def.name.clone(),
                signature: m.signature.clone(),
                kind: m.def.kind.clone(),
                direction: m.direction,
            })
            .collect()
    }

    /// Signature of the first member called `name`.
    pub fn signature_of(&self, name: &str) -> Option<&str> {
        self.core
            .members
            .iter()
            .find(|m| m.def.name == name)
            .map(|m| m.signature.as_str())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.core.events.subscribe()
    }

    /// Registers a filter run on every inbound member message before it is
    /// applied; returning [`Handling::Handled`] stops processing.
    pub fn add_message_filter<F>(&self, filter: F)
    where
        F: Fn(&RemoteMessage) -> Handling + Send + Sync + 'static,
    {
        self.core
            .filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(filter));
    }

    /// Applies one inbound message. The inbound loop calls this for every
    /// message the handler delivers.
    pub fn process(&self, message: &RemoteMessage) -> RemoteResult<InboundOutcome> {
        self.core.process(message)
    }

    /// Next call number for `method_name`; linked nodes calling the same
    /// method in lockstep draw the same numbers.
    pub(crate) fn next_call_sequence(&self, method_name: &str) -> u64 {
        let mut sequences = self
            .core
            .call_sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let seq = sequences.entry(method_name.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Detaches from the instance and stops listening. The transport stays
    /// open.
    pub fn dispose(&self) {
        self.core.detach();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if !tasks.is_empty() {
            for task in tasks {
                task.abort();
            }
            tracing::debug!(remote_id = %self.core.id, "member remote disposed");
        }
    }
}

impl<T: Remotable> Drop for MemberRemote<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn bind<T>(
    def: MemberDef<T>,
    owner: &TypeIdentity,
    type_direction: Option<RemotingDirection>,
    scope: SignatureScope,
) -> BoundMember<T> {
    let signature = match &def.kind {
        MemberKind::Property { value_type } => member_signature(
            scope,
            owner,
            MemberShape::Property {
                name: &def.name,
                value_type,
            },
        ),
        MemberKind::Method { params, returns } => member_signature(
            scope,
            owner,
            MemberShape::Method {
                name: &def.name,
                params,
                returns,
            },
        ),
    };
    let direction = def.direction.or(type_direction);
    BoundMember {
        def,
        signature,
        direction,
    }
}

async fn inbound_loop<T: Remotable>(
    core: Arc<RemoteCore<T>>,
    mut inbound: broadcast::Receiver<RemoteMessage>,
) {
    loop {
        match inbound.recv().await {
            Ok(message) => {
                let dispatch = panic::catch_unwind(AssertUnwindSafe(|| core.receive(&message)));
                if let Err(payload) = dispatch {
                    tracing::error!(
                        remote_id = %core.id,
                        kind = message.kind(),
                        signature = message.signature().unwrap_or_default(),
                        panic = panic_message(payload.as_ref()),
                        "member panicked while applying inbound message"
                    );
                    core.emit(RemoteEvent::Failed {
                        signature: message.signature().map(str::to_string),
                        error: format!("panicked: {}", panic_message(payload.as_ref())),
                    });
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(remote_id = %core.id, skipped, "inbound messages dropped, receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!(remote_id = %core.id, "inbound stream closed");
                break;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

async fn outbound_pump<T: Remotable>(
    core: Arc<RemoteCore<T>>,
    mut outbound: mpsc::UnboundedReceiver<RemoteMessage>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(err) = core.deliver(message.clone()).await {
            tracing::warn!(
                remote_id = %core.id,
                kind = message.kind(),
                error = %err,
                "failed to send remote message"
            );
            core.emit(RemoteEvent::Failed {
                signature: message.signature().map(str::to_string),
                error: err.to_string(),
            });
        }
    }
}

impl<T: Remotable> RemoteCore<T> {
    fn detach(self: &Arc<Self>) {
        self.instance
            .interceptor()
            .detach(Arc::as_ptr(self) as *const ());
    }

    fn emit(&self, event: RemoteEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn enqueue(&self, message: RemoteMessage) {
        if self.outbound.send(message).is_err() {
            tracing::debug!(remote_id = %self.id, "outbound queue closed, message dropped");
        }
    }

    async fn deliver(&self, message: RemoteMessage) -> RemoteResult<()> {
        self.handler.ensure_connected().await?;
        self.handler.send(message.clone(), None).await?;
        tracing::debug!(
            remote_id = %self.id,
            kind = message.kind(),
            signature = message.signature().unwrap_or_default(),
            "remote message sent"
        );
        self.emit(RemoteEvent::Sent(message));
        Ok(())
    }

    fn receive(&self, message: &RemoteMessage) {
        match self.process(message) {
            Ok(InboundOutcome::UnknownMember { signature }) => {
                tracing::warn!(remote_id = %self.id, %signature, "no local member matches inbound message");
            }
            Ok(outcome) => {
                tracing::trace!(remote_id = %self.id, kind = message.kind(), ?outcome, "inbound message processed");
            }
            Err(err) => {
                tracing::error!(
                    remote_id = %self.id,
                    kind = message.kind(),
                    error = %err,
                    "failed to apply inbound message"
                );
                self.emit(RemoteEvent::Failed {
                    signature: message.signature().map(str::to_string),
                    error: err.to_string(),
                });
            }
        }
    }

    fn process(&self, message: &RemoteMessage) -> RemoteResult<InboundOutcome> {
        if !message.targets(&self.id) {
            return Ok(InboundOutcome::Ignored(IgnoreReason::OtherTarget));
        }
        if matches!(
            message.body,
            MessageBody::Data { .. } | MessageBody::MethodProxy { .. }
        ) {
            return Ok(InboundOutcome::Ignored(IgnoreReason::NotMemberMessage));
        }
        if self.run_filters(message) == Handling::Handled {
            return Ok(InboundOutcome::Handled);
        }

        let _expectancy = ExpectancyGuard::enter(self.instance_key);
        let outcome = match &message.body {
            MessageBody::MethodCall {
                signature,
                arguments,
            } => self.apply_method(signature, arguments)?,
            MessageBody::PropertyChange {
                signature,
                new_value,
                ..
            } => self.apply_property(signature, new_value)?,
            MessageBody::Exception {
                message: text,
                stack_trace,
                signature,
            } => {
                tracing::warn!(remote_id = %self.id, %signature, error = %text, "peer reported a failure");
                self.emit(RemoteEvent::RemoteException {
                    message: text.clone(),
                    stack_trace: stack_trace.clone(),
                    signature: signature.clone(),
                });
                InboundOutcome::Observed {
                    signature: signature.clone(),
                }
            }
            MessageBody::Data { .. } | MessageBody::MethodProxy { .. } => {
                InboundOutcome::Ignored(IgnoreReason::NotMemberMessage)
            }
        };

        if matches!(outcome, InboundOutcome::Applied { .. }) {
            self.emit(RemoteEvent::Received(message.clone()));
        }
        Ok(outcome)
    }

    fn run_filters(&self, message: &RemoteMessage) -> Handling {
        let filters = self
            .filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if filters.iter().any(|filter| filter(message) == Handling::Handled) {
            Handling::Handled
        } else {
            Handling::Continue
        }
    }

    fn find_by_signature(&self, signature: &str) -> Option<&BoundMember<T>> {
        self.members.iter().find(|m| m.signature == signature)
    }

    fn find_by_name(&self, name: &str, method: bool) -> Option<&BoundMember<T>> {
        self.members.iter().find(|m| {
            m.def.name == name && matches!(m.def.kind, MemberKind::Method { .. }) == method
        })
    }

    fn unknown(&self, signature: &str) -> RemoteResult<InboundOutcome> {
        if self.options.strict_signatures {
            Err(RemoteError::UnknownMember {
                signature: signature.to_string(),
            })
        } else {
            Ok(InboundOutcome::UnknownMember {
                signature: signature.to_string(),
            })
        }
    }

    fn can_receive(&self, member: &BoundMember<T>) -> bool {
        member
            .direction
            .is_some_and(|direction| direction.permits(self.handler.mode(), true))
    }

    fn apply_method(&self, signature: &str, arguments: &[Argument]) -> RemoteResult<InboundOutcome> {
        let Some(member) = self.find_by_signature(signature) else {
            return self.unknown(signature);
        };
        let (MemberKind::Method { params, .. }, Apply::Invoke(invoke)) = (&member.def.kind, &member.def.apply) else {
            return self.unknown(signature);
        };
        if !self.can_receive(member) {
            tracing::debug!(remote_id = %self.id, %signature, "inbound call not permitted for this mode");
            return Ok(InboundOutcome::Ignored(IgnoreReason::DirectionDenied));
        }
        if arguments.len() != params.len() {
            return Err(RemoteError::ArgumentCount {
                signature: signature.to_string(),
                expected: params.len(),
                actual: arguments.len(),
            });
        }

        let values = arguments
            .iter()
            .zip(params)
            .map(|(arg, declared)| reconcile(arg.value.clone(), declared, &self.options.converters))
            .collect::<Result<Vec<_>, _>>()?;

        let arguments = Arguments::with_declared(values, params.clone());
        if let Err(err) = invoke(self.instance.as_ref(), &arguments) {
            let err = match conversion_failure(err) {
                Ok(conversion) => return Err(RemoteError::Conversion(conversion)),
                Err(err) => err,
            };
            self.report_failure(&member.signature, &*err);
            return Err(RemoteError::Invocation {
                signature: signature.to_string(),
                message: err.to_string(),
            });
        }

        tracing::debug!(remote_id = %self.id, %signature, "inbound method call applied");
        Ok(InboundOutcome::Applied {
            signature: signature.to_string(),
        })
    }

    fn apply_property(&self, signature: &str, new_value: &Value) -> RemoteResult<InboundOutcome> {
        let Some(member) = self.find_by_signature(signature) else {
            return self.unknown(signature);
        };
        let (MemberKind::Property { value_type }, Apply::Set(set)) = (&member.def.kind, &member.def.apply) else {
            return self.unknown(signature);
        };
        if !self.can_receive(member) {
            tracing::debug!(remote_id = %self.id, %signature, "inbound change not permitted for this mode");
            return Ok(InboundOutcome::Ignored(IgnoreReason::DirectionDenied));
        }

        let value = reconcile(new_value.clone(), value_type, &self.options.converters)?;
        set(self.instance.as_ref(), value).map_err(|err| match conversion_failure(err) {
            Ok(conversion) => RemoteError::Conversion(conversion),
            Err(err) => RemoteError::Invocation {
                signature: signature.to_string(),
                message: err.to_string(),
            },
        })?;

        tracing::debug!(remote_id = %self.id, %signature, "inbound property change applied");
        Ok(InboundOutcome::Applied {
            signature: signature.to_string(),
        })
    }

    /// Sends a failure that happened while applying an inbound call back out;
    /// the peer sees it as a message, never as a propagated error.
    fn report_failure(&self, signature: &str, error: &(dyn std::error::Error + Send + Sync + 'static)) {
        self.enqueue(RemoteMessage::targeted(
            self.id.clone(),
            MessageBody::Exception {
                message: error.to_string(),
                stack_trace: error_chain(error),
                signature: signature.to_string(),
            },
        ));
    }

    /// Resolves an outbound notification to a member that may send.
    fn sendable(&self, name: &str, method: bool) -> Option<&BoundMember<T>> {
        if expectancy::is_expected(self.instance_key) {
            tracing::trace!(remote_id = %self.id, member = name, "suppressing echo of inbound change");
            return None;
        }
        let Some(member) = self.find_by_name(name, method) else {
            tracing::debug!(remote_id = %self.id, member = name, "member not registered for remoting");
            return None;
        };
        let direction = member.direction?;
        if !direction.permits(self.handler.mode(), false) {
            tracing::trace!(remote_id = %self.id, member = name, "outbound change not permitted for this mode");
            return None;
        }
        Some(member)
    }
}

/// Splits conversion failures raised while decoding a member's value from
/// failures raised by the member itself.
fn conversion_failure(err: InvokeError) -> Result<ConversionError, InvokeError> {
    let err = match err.downcast::<ConversionError>() {
        Ok(conversion) => return Ok(*conversion),
        Err(err) => err,
    };
    match err.downcast::<RemoteError>() {
        Ok(remote) => match *remote {
            RemoteError::Conversion(conversion) => Ok(conversion),
            other => Err(Box::new(other) as InvokeError),
        },
        Err(err) => Err(err),
    }
}

impl<T: Remotable> InterceptSink for RemoteCore<T> {
    fn property_set(&self, name: &str, old_value: Value, new_value: Value) {
        let Some(member) = self.sendable(name, false) else {
            return;
        };
        self.enqueue(RemoteMessage::targeted(
            self.id.clone(),
            MessageBody::PropertyChange {
                signature: member.signature.clone(),
                old_value,
                new_value,
            },
        ));
    }

    fn method_entered(&self, name: &str, arguments: Vec<Value>) {
        let Some(member) = self.sendable(name, true) else {
            return;
        };
        let MemberKind::Method { params, .. } = &member.def.kind else {
            return;
        };
        if params.len() != arguments.len() {
            tracing::warn!(
                remote_id = %self.id,
                signature = %member.signature,
                expected = params.len(),
                actual = arguments.len(),
                "argument count mismatch, call not remoted"
            );
            return;
        }
        let arguments = params
            .iter()
            .cloned()
            .zip(arguments)
            .map(|(value_type, value)| Argument { value_type, value })
            .collect();
        self.enqueue(RemoteMessage::targeted(
            self.id.clone(),
            MessageBody::MethodCall {
                signature: member.signature.clone(),
                arguments,
            },
        ));
    }

    fn method_failed(&self, name: &str, message: String, stack_trace: String) {
        let Some(member) = self.sendable(name, true) else {
            return;
        };
        self.enqueue(RemoteMessage::targeted(
            self.id.clone(),
            MessageBody::Exception {
                message,
                stack_trace,
                signature: member.signature.clone(),
            },
        ));
    }
}
