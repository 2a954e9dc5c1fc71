//! Comparable member identities.
//!
//! Two nodes treat members as "the same" when their signatures are equal, so
//! every linked node must compute signatures with the same
//! [`SignatureScope`].

use crate::value::ValueType;
use encore_core::SignatureScope;
use std::fmt;

/// Where a remotable type is declared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeIdentity {
    pub crate_name: String,
    pub module_path: String,
    pub type_name: String,
}

impl TypeIdentity {
    pub fn of<T: ?Sized>() -> Self {
        Self::parse(std::any::type_name::<T>())
    }

    /// Parses a `crate::module::Type<Args>` path; generic arguments are dropped.
    pub fn parse(path: &str) -> Self {
        let base = path.split('<').next().unwrap_or(path);
        let mut segments: Vec<&str> = base.split("::").filter(|s| !s.is_empty()).collect();
        let type_name = segments.pop().unwrap_or_default().to_string();
        let crate_name = if segments.is_empty() {
            String::new()
        } else {
            segments.remove(0).to_string()
        };
        Self {
            crate_name,
            module_path: segments.join("::"),
            type_name,
        }
    }

    fn qualifier(&self, scope: SignatureScope) -> String {
        let parts: Vec<&str> = match scope {
            SignatureScope::Assembly => vec![
                self.crate_name.as_str(),
                self.module_path.as_str(),
                self.type_name.as_str(),
            ],
            SignatureScope::Namespace => vec![self.module_path.as_str(), self.type_name.as_str()],
            SignatureScope::DeclaringType => vec![self.type_name.as_str()],
            SignatureScope::Name => Vec::new(),
        };
        parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .map(|p| format!("{p}::"))
            .collect()
    }
}

impl fmt::Display for TypeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.qualifier(SignatureScope::Assembly).trim_end_matches("::"))
    }
}

/// The parts of a member that take part in its signature.
#[derive(Debug, Clone, Copy)]
pub enum MemberShape<'a> {
    Property {
        name: &'a str,
        value_type: &'a ValueType,
    },
    Method {
        name: &'a str,
        params: &'a [ValueType],
        returns: &'a ValueType,
    },
}

pub fn member_signature(scope: SignatureScope, owner: &TypeIdentity, shape: MemberShape<'_>) -> String {
    let qualifier = owner.qualifier(scope);
    match shape {
        MemberShape::Property { name, value_type } => format!("{qualifier}{name}: {value_type}"),
        MemberShape::Method {
            name,
            params,
            returns,
        } => {
            let params = params
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            format!("{qualifier}{name}({params}) -> {returns}")
        }
    }
}
