//! Member remoting for Encore.
//!
//! Keeps the tagged properties and methods of linked instances in sync across
//! nodes, without call sites knowing about it.
//!
//! This crate provides:
//! - Explicit member registration ([`MemberTable`]) and a per-instance
//!   [`Interceptor`] that remotable types report member activity to
//! - [`MemberRemote`], which turns that activity into messages and applies
//!   inbound messages to the local instance
//! - The [`MessageHandler`] transport contract and an in-process
//!   [`MemoryBus`]
//! - Token-correlated helpers built on the same messages: the data proxy,
//!   [`RemoteMethodProxy`] and the remote lock
//!
//! # Linking
//!
//! Two member remotes are linked when they share a [`RemoteId`] and their
//! handlers reach each other. Members are matched by signature, so every
//! node must use the same [`SignatureScope`](encore_core::SignatureScope).
//!
//! # Usage
//!
//! ```rust,ignore
//! use encore_remote::{MemberRemote, MemoryBus, RemoteOptions};
//! use encore_core::RemotingMode;
//!
//! let bus = MemoryBus::new();
//! let host = MemberRemote::attach(deck_a, "deck", Some(bus.handler(RemotingMode::HOST)), RemoteOptions::default()).await?;
//! let client = MemberRemote::attach(deck_b, "deck", Some(bus.handler(RemotingMode::CLIENT)), RemoteOptions::default()).await?;
//!
//! host.instance().set_volume(0.25);
//! ```

mod cancel;
pub mod data_proxy;
mod error;
pub mod expectancy;
pub mod handler;
pub mod member;
pub mod member_remote;
pub mod message;
pub mod method_proxy;
pub mod remote_lock;
pub mod signature;
pub mod value;

pub use cancel::Cancellation;
pub use data_proxy::{publish_data, receive_data};
pub use error::{RemoteError, RemoteResult};
pub use expectancy::ExpectancyGuard;
pub use handler::{
    clear_default_handler, default_handler, set_default_handler, JsonCodec, MemoryBus,
    MemoryHandler, MessageCodec, MessageHandler,
};
pub use member::{Arguments, Interceptor, InvokeError, MemberDef, MemberKind, MemberTable, Remotable};
pub use member_remote::{
    Handling, IgnoreReason, InboundOutcome, MemberInfo, MemberRemote, RemoteEvent, RemoteOptions,
};
pub use message::{Argument, MessageBody, RemoteId, RemoteMessage};
pub use method_proxy::RemoteMethodProxy;
pub use remote_lock::{remote_release, remote_wait};
pub use signature::{member_signature, MemberShape, TypeIdentity};
pub use value::{
    ConversionError, ConverterRegistry, RemoteValue, ValueConverter, ValueType,
};
