//! Strongly-typed identifiers and account identity.
//!
//! These prevent mixing up IDs from different contexts.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier from a string.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Generate a new unique identifier using UUID v4.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Get the inner string value.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

define_id!(AccountId, "Unique identifier for a trading account.");
define_id!(ExchangeId, "Identifier for one exchange connection.");
define_id!(OrderId, "Engine-internal unique identifier for an order.");
define_id!(PositionId, "Engine-internal unique identifier for a position.");

/// Role of a trading account within the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    /// The operator's own master account.
    Master,
    /// A managed user account.
    User,
}

/// A master or user trading identity.
///
/// Accounts are created at process start from configuration and live for the
/// whole process. Each account is an isolated risk and capital boundary; it
/// owns zero or more exchange connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Account identifier.
    pub id: AccountId,
    /// Master or user.
    pub role: AccountRole,
    /// Exchanges this account trades on.
    pub exchanges: Vec<ExchangeId>,
}

impl Account {
    /// Create an account with the given connections.
    #[must_use]
    pub fn new(id: impl Into<AccountId>, role: AccountRole, exchanges: Vec<ExchangeId>) -> Self {
        Self {
            id: id.into(),
            role,
            exchanges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let id = AccountId::new("master");
        assert_eq!(id.as_str(), "master");
        assert_eq!(id.to_string(), "master");
        assert_eq!(AccountId::from("master"), id);
    }

    #[test]
    fn test_generate_is_unique() {
        assert_ne!(OrderId::generate(), OrderId::generate());
    }

    #[test]
    fn test_id_serde_transparent() {
        let id = ExchangeId::new("paper");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"paper\"");
    }
}
