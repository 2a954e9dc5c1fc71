//! Role and direction vocabulary shared by every remoting participant.
//!
//! A node plays one or both roles ([`RemotingMode`]); each remotable member
//! carries a [`RemotingDirection`] describing, per role, whether it accepts
//! inbound changes and whether it emits outbound ones.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// The role(s) this process plays in a remoting relationship.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RemotingMode: u8 {
        const CLIENT = 0b01;
        const HOST = 0b10;
        const FULL = Self::CLIENT.bits() | Self::HOST.bits();
    }
}

impl RemotingMode {
    /// No role; nothing is sent or applied.
    pub const NONE: Self = Self::empty();

    pub fn is_client(&self) -> bool {
        self.contains(Self::CLIENT)
    }

    pub fn is_host(&self) -> bool {
        self.contains(Self::HOST)
    }
}

impl Default for RemotingMode {
    fn default() -> Self {
        Self::FULL
    }
}

bitflags! {
    /// Per-role flow policy for a member.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RemotingDirection: u8 {
        const INBOUND_HOST = 0b0001;
        const INBOUND_CLIENT = 0b0010;
        const OUTBOUND_HOST = 0b0100;
        const OUTBOUND_CLIENT = 0b1000;

        const INBOUND = Self::INBOUND_HOST.bits() | Self::INBOUND_CLIENT.bits();
        const OUTBOUND = Self::OUTBOUND_HOST.bits() | Self::OUTBOUND_CLIENT.bits();
        const HOST_TO_CLIENT = Self::OUTBOUND_HOST.bits() | Self::INBOUND_CLIENT.bits();
        const CLIENT_TO_HOST = Self::OUTBOUND_CLIENT.bits() | Self::INBOUND_HOST.bits();
        const BIDIRECTIONAL = Self::INBOUND.bits() | Self::OUTBOUND.bits();
    }
}

impl RemotingDirection {
    /// Whether a node running in `mode` may emit changes of a member tagged
    /// with this direction.
    pub fn can_send(&self, mode: RemotingMode) -> bool {
        (self.contains(Self::OUTBOUND_CLIENT) && mode.is_client())
            || (self.contains(Self::OUTBOUND_HOST) && mode.is_host())
    }

    /// Whether a node running in `mode` may apply inbound changes to a member
    /// tagged with this direction.
    pub fn can_receive(&self, mode: RemotingMode) -> bool {
        (self.contains(Self::INBOUND_CLIENT) && mode.is_client())
            || (self.contains(Self::INBOUND_HOST) && mode.is_host())
    }

    /// Selects the inbound or outbound gate depending on `receiving`.
    pub fn permits(&self, mode: RemotingMode, receiving: bool) -> bool {
        if receiving {
            self.can_receive(mode)
        } else {
            self.can_send(mode)
        }
    }
}

/// How much of a member's qualified identity takes part in signature
/// comparison between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScope {
    /// Crate, module path, declaring type and member name.
    Assembly,
    /// Module path (without the crate root), declaring type and member name.
    Namespace,
    /// Declaring type and member name.
    #[default]
    DeclaringType,
    /// Member name only.
    Name,
}

impl SignatureScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureScope::Assembly => "assembly",
            SignatureScope::Namespace => "namespace",
            SignatureScope::DeclaringType => "declaring_type",
            SignatureScope::Name => "name",
        }
    }
}
