//! Explicit registration of remotable members and per-instance interception.
//!
//! A remotable type lists its properties and methods in a [`MemberTable`],
//! each optionally tagged with a [`RemotingDirection`]; untagged members fall
//! back to the table's type-level tag, and members with neither are never
//! remoted. The type embeds an [`Interceptor`] and reports property writes
//! and method entries to it; the interceptor forwards them to whichever
//! member remote the instance is attached to.

use crate::error::{RemoteError, RemoteResult};
use crate::signature::TypeIdentity;
use crate::value::{kind_of, to_value, ConversionError, RemoteValue, ValueType};
use encore_core::RemotingDirection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

/// Error type returned by remoted method bodies and setters.
pub type InvokeError = Box<dyn std::error::Error + Send + Sync>;

type Setter<T> = Arc<dyn Fn(&T, Value) -> Result<(), InvokeError> + Send + Sync>;
type Invoker<T> = Arc<dyn Fn(&T, &Arguments) -> Result<(), InvokeError> + Send + Sync>;

/// A type whose instances can be bound to a member remote.
pub trait Remotable: Send + Sync + Sized + 'static {
    fn interceptor(&self) -> &Interceptor;

    /// Called once per member remote, at attach time.
    fn members() -> MemberTable<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberKind {
    Property {
        value_type: ValueType,
    },
    Method {
        params: Vec<ValueType>,
        returns: ValueType,
    },
}

pub(crate) enum Apply<T> {
    Set(Setter<T>),
    Invoke(Invoker<T>),
}

pub struct MemberDef<T> {
    pub(crate) name: String,
    pub(crate) kind: MemberKind,
    pub(crate) direction: Option<RemotingDirection>,
    pub(crate) apply: Apply<T>,
}

impl<T> MemberDef<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &MemberKind {
        &self.kind
    }

    /// The member-level tag, if any.
    pub fn direction(&self) -> Option<RemotingDirection> {
        self.direction
    }
}

impl<T> fmt::Debug for MemberDef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .finish()
    }
}

/// Builder listing the remotable members of `T`.
pub struct MemberTable<T> {
    owner: TypeIdentity,
    direction: Option<RemotingDirection>,
    members: Vec<MemberDef<T>>,
}

impl<T: 'static> Default for MemberTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> MemberTable<T> {
    pub fn new() -> Self {
        Self {
            owner: TypeIdentity::of::<T>(),
            direction: None,
            members: Vec::new(),
        }
    }

    /// Overrides the declaring type identity used in signatures.
    pub fn identity(mut self, owner: TypeIdentity) -> Self {
        self.owner = owner;
        self
    }

    /// Type-level tag applied to members without their own.
    pub fn direction(mut self, direction: RemotingDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn property<V, F>(mut self, name: &str, setter: F) -> Self
    where
        V: RemoteValue,
        F: Fn(&T, V) + Send + Sync + 'static,
    {
        let apply: Setter<T> = Arc::new(move |target: &T, value: Value| -> Result<(), InvokeError> {
            let received = kind_of(&value);
            let value: V = serde_json::from_value(value).map_err(|_| ConversionError::Unsupported {
                expected: V::value_type().to_string(),
                received: received.to_string(),
            })?;
            setter(target, value);
            Ok(())
        });
        self.members.push(MemberDef {
            name: name.to_string(),
            kind: MemberKind::Property {
                value_type: V::value_type(),
            },
            direction: None,
            apply: Apply::Set(apply),
        });
        self
    }

    pub fn method<F>(
        mut self,
        name: &str,
        params: impl IntoIterator<Item = ValueType>,
        returns: ValueType,
        invoker: F,
    ) -> Self
    where
        F: Fn(&T, &Arguments) -> Result<(), InvokeError> + Send + Sync + 'static,
    {
        self.members.push(MemberDef {
            name: name.to_string(),
            kind: MemberKind::Method {
                params: params.into_iter().collect(),
                returns,
            },
            direction: None,
            apply: Apply::Invoke(Arc::new(invoker)),
        });
        self
    }

    /// Tags the most recently added member.
    pub fn tagged(mut self, direction: RemotingDirection) -> Self {
        if let Some(member) = self.members.last_mut() {
            member.direction = Some(direction);
        }
        self
    }

    pub fn owner(&self) -> &TypeIdentity {
        &self.owner
    }

    pub fn type_direction(&self) -> Option<RemotingDirection> {
        self.direction
    }

    pub fn members(&self) -> &[MemberDef<T>] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Member tag first, then the type tag; `None` means not remoted.
    pub fn resolve_direction(&self, member: &MemberDef<T>) -> Option<RemotingDirection> {
        member.direction.or(self.direction)
    }

    pub(crate) fn into_parts(self) -> (TypeIdentity, Option<RemotingDirection>, Vec<MemberDef<T>>) {
        (self.owner, self.direction, self.members)
    }
}

/// Reconciled arguments handed to a remoted method body.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    values: Vec<Value>,
    declared: Vec<ValueType>,
}

impl Arguments {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            declared: Vec::new(),
        }
    }

    /// Arguments paired with the parameter types the method declares, so
    /// conversion errors name the declared type.
    pub fn with_declared(values: Vec<Value>, declared: Vec<ValueType>) -> Self {
        Self { values, declared }
    }

    pub fn get<V: DeserializeOwned>(&self, index: usize) -> RemoteResult<V> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| RemoteError::ArgumentCount {
                signature: format!("argument {index}"),
                expected: index + 1,
                actual: self.values.len(),
            })?;
        serde_json::from_value(value.clone()).map_err(|_| {
            let expected = match self.declared.get(index) {
                Some(declared) => declared.to_string(),
                None => std::any::type_name::<V>().to_string(),
            };
            RemoteError::Conversion(ConversionError::Unsupported {
                expected,
                received: kind_of(value).to_string(),
            })
        })
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Receives member activity reported through an [`Interceptor`].
pub(crate) trait InterceptSink: Send + Sync {
    fn property_set(&self, name: &str, old_value: Value, new_value: Value);
    fn method_entered(&self, name: &str, arguments: Vec<Value>);
    fn method_failed(&self, name: &str, message: String, stack_trace: String);
}

/// Per-instance hook slot. With no member remote attached every call is a
/// no-op, so remotable types work unchanged when not remoted.
#[derive(Default)]
pub struct Interceptor {
    sink: RwLock<Option<Weak<dyn InterceptSink>>>,
}

impl Interceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        self.sink().is_some()
    }

    /// Reports a property write.
    pub fn property_set<V: Serialize>(&self, name: &str, old_value: &V, new_value: &V) {
        let Some(sink) = self.sink() else {
            return;
        };
        match (to_value(old_value), to_value(new_value)) {
            (Ok(old_value), Ok(new_value)) => sink.property_set(name, old_value, new_value),
            (Err(err), _) | (_, Err(err)) => {
                tracing::warn!(member = name, error = %err, "property value not serializable");
            }
        }
    }

    /// Reports entry into a method, with its arguments in declaration order.
    pub fn method_entered(&self, name: &str, arguments: Vec<Value>) {
        if let Some(sink) = self.sink() {
            sink.method_entered(name, arguments);
        }
    }

    /// Reports a failure raised from inside a method body.
    pub fn method_failed(&self, name: &str, error: &(dyn std::error::Error + 'static)) {
        if let Some(sink) = self.sink() {
            sink.method_failed(name, error.to_string(), error_chain(error));
        }
    }

    pub(crate) fn attach(&self, sink: Weak<dyn InterceptSink>) -> RemoteResult<()> {
        let mut slot = self.sink.write().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|existing| existing.strong_count() > 0) {
            return Err(RemoteError::AlreadyAttached);
        }
        *slot = Some(sink);
        Ok(())
    }

    /// Clears the slot if it still points at `owner`. A successor attached
    /// after `owner` let go keeps its slot.
    pub(crate) fn detach(&self, owner: *const ()) {
        let mut slot = self.sink.write().unwrap_or_else(PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|existing| existing.as_ptr() as *const () == owner)
        {
            slot.take();
        }
    }

    fn sink(&self) -> Option<Arc<dyn InterceptSink>> {
        self.sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Renders an error and its sources, outermost first.
pub(crate) fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut lines = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Fader {
        interceptor: Interceptor,
        level: Mutex<u32>,
    }

    impl Remotable for Fader {
        fn interceptor(&self) -> &Interceptor {
            &self.interceptor
        }

        fn members() -> MemberTable<Self> {
            MemberTable::new()
                .direction(RemotingDirection::HOST_TO_CLIENT)
                .property("level", |fader: &Fader, level: u32| {
                    *fader.level.lock().unwrap() = level;
                })
                .method("reset", [], ValueType::Unit, |fader: &Fader, _args: &Arguments| {
                    *fader.level.lock().unwrap() = 0;
                    Ok(())
                })
                .tagged(RemotingDirection::BIDIRECTIONAL)
                .method("debug_dump", [], ValueType::Unit, |_: &Fader, _: &Arguments| Ok(()))
        }
    }

    #[test]
    fn table_records_members_in_order() {
        let table = Fader::members();
        let names: Vec<_> = table.members().iter().map(|m| m.name()).collect();
        assert_eq!(names, ["level", "reset", "debug_dump"]);
        assert_eq!(table.owner().type_name, "Fader");
    }

    #[test]
    fn member_tag_overrides_type_tag() {
        let table = Fader::members();
        let members = table.members();
        assert_eq!(
            table.resolve_direction(&members[0]),
            Some(RemotingDirection::HOST_TO_CLIENT)
        );
        assert_eq!(
            table.resolve_direction(&members[1]),
            Some(RemotingDirection::BIDIRECTIONAL)
        );
    }

    #[test]
    fn untagged_table_disables_members() {
        let table = MemberTable::<Fader>::new().property("level", |_: &Fader, _: u32| {});
        assert_eq!(table.resolve_direction(&table.members()[0]), None);
    }

    #[test]
    fn property_setter_deserializes_value() {
        let fader = Fader::default();
        let table = Fader::members();
        match &table.members()[0].apply {
            Apply::Set(set) => set(&fader, json!(9)).unwrap(),
            Apply::Invoke(_) => panic!("expected setter"),
        }
        assert_eq!(*fader.level.lock().unwrap(), 9);
    }

    #[test]
    fn arguments_report_bad_types() {
        let args = Arguments::new(vec![json!("x")]);
        assert_eq!(args.get::<String>(0).unwrap(), "x");
        assert!(matches!(
            args.get::<u32>(0),
            Err(RemoteError::Conversion(ConversionError::Unsupported { .. }))
        ));
        assert!(matches!(
            args.get::<u32>(3),
            Err(RemoteError::ArgumentCount { .. })
        ));
    }

    #[test]
    fn setter_rejects_mistyped_values_as_conversion_errors() {
        let fader = Fader::default();
        let table = Fader::members();
        let Apply::Set(set) = &table.members()[0].apply else {
            panic!("expected setter");
        };
        let err = set(&fader, json!("loud")).unwrap_err();
        let err = err.downcast::<ConversionError>().unwrap();
        assert_eq!(
            *err,
            ConversionError::Unsupported {
                expected: "u32".into(),
                received: "string".into(),
            }
        );
    }

    #[test]
    fn declared_argument_types_name_conversion_errors() {
        let args = Arguments::with_declared(vec![json!(3)], vec![ValueType::Named("Cue".into())]);
        match args.get::<Vec<String>>(0) {
            Err(RemoteError::Conversion(ConversionError::Unsupported { expected, received })) => {
                assert_eq!(expected, "Cue");
                assert_eq!(received, "integer");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn detached_interceptor_is_inert() {
        let fader = Fader::default();
        assert!(!fader.interceptor().is_attached());
        fader.interceptor().property_set("level", &1u32, &2u32);
        fader.interceptor().method_entered("reset", Vec::new());
    }

    #[test]
    fn error_chain_lists_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = RemoteError::Transport {
            message: "send failed".into(),
        };
        assert_eq!(error_chain(&err), "transport error: send failed");
        assert_eq!(error_chain(&io), "disk gone");
    }
}
