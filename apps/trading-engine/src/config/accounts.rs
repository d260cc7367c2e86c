//! Account roster configuration.

use serde::{Deserialize, Serialize};

use crate::models::{Account, AccountId, AccountRole, ExchangeId};

/// One trading account as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account identifier.
    pub id: String,
    /// Master or user account.
    #[serde(default = "default_role")]
    pub role: AccountRole,
    /// Exchange connections this account trades on.
    pub exchanges: Vec<String>,
}

impl AccountConfig {
    /// Materialize the runtime [`Account`].
    #[must_use]
    pub fn to_account(&self) -> Account {
        Account::new(
            AccountId::new(&self.id),
            self.role,
            self.exchanges.iter().map(ExchangeId::new).collect(),
        )
    }
}

const fn default_role() -> AccountRole {
    AccountRole::User
}
