//! Upstream account model
//!
//! Accounts are owned by the caller (loaded from the account store outside
//! this crate) and treated as read-only within the fallback core.

use serde::{Deserialize, Serialize};

/// Operational status of an upstream account, as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum AccountStatus {
    /// Account is operating normally
    Normal,
    /// Account is in an error state
    Error,
    /// Account is being rate-limited upstream
    Throttled,
}

impl From<AccountStatus> for i32 {
    fn from(status: AccountStatus) -> Self {
        match status {
            AccountStatus::Normal => 1,
            AccountStatus::Error => 2,
            AccountStatus::Throttled => 3,
        }
    }
}

impl TryFrom<i32> for AccountStatus {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, String> {
        match code {
            1 => Ok(Self::Normal),
            2 => Ok(Self::Error),
            3 => Ok(Self::Throttled),
            other => Err(format!("unknown account status code: {other}")),
        }
    }
}

/// A credential/identity for one upstream model provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Stable identifier
    pub id: u64,
    /// Display name
    pub name: String,
    /// Platform tag (e.g. which provider this credential belongs to)
    pub platform: String,
    /// Selection priority; smaller is preferred
    pub priority: i32,
    /// Selection weight; larger is preferred
    pub weight: i32,
    /// Number of requests routed to this account today
    pub today_usage_count: i64,
    /// Current operational status
    pub current_status: AccountStatus,
}

/// Serialisable account summary carried inside a fallback result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Stable identifier
    pub id: u64,
    /// Display name
    pub name: String,
    /// Platform tag
    pub platform: String,
    /// Selection priority
    pub priority: i32,
}

impl From<&Account> for AccountInfo {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            name: account.name.clone(),
            platform: account.platform.clone(),
            priority: account.priority,
        }
    }
}
