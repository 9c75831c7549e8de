//! Type-safe identifier wrappers around `u64`.
//!
//! Identifiers are assigned monotonically by their owner (the simulator for
//! agents, the server for clients) and are never reused within the owner's
//! lifetime, so a stale id can never alias a newer entity.

use serde::{Deserialize, Serialize};

/// Generates a newtype wrapper around `u64` with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Return the inner integer value.
            pub const fn into_inner(self) -> u64 {
                self.0
            }

            /// The identifier that follows this one, or `None` on overflow.
            pub const fn next(self) -> Option<Self> {
                match self.0.checked_add(1) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for an agent living in a simulator.
    #[derive(Default)]
    AgentId
}

define_id! {
    /// Unique identifier for a client session connected to a server.
    ClientId
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn next_is_monotonic() {
        let id = AgentId(7);
        assert_eq!(id.next(), Some(AgentId(8)));
        assert_eq!(AgentId(u64::MAX).next(), None);
    }

    #[test]
    fn serializes_transparently() {
        let json = serde_json::to_string(&ClientId(42)).unwrap();
        assert_eq!(json, "42");
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ClientId(42));
    }
}
