use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Error;
use crate::models::{AccountId, UserId};

/// Encrypted OAuth token pair as persisted in the store.
///
/// At most one row exists per account and per user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    pub user_id: UserId,
    pub account_id: AccountId,
    pub access_ciphertext: Vec<u8>,
    pub refresh_ciphertext: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Plaintext tokens returned by the CRM token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"***")
            .field("refresh_token", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Outcome classification for a failed refresh.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The refresh token was revoked or expired; only a new authorization helps.
    #[error("invalid grant: {0}")]
    InvalidGrant(String),
    #[error(transparent)]
    Other(#[from] Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub account_id: Option<AccountId>,
    pub account_name: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            account_id: None,
            account_name: None,
            expires_at: None,
        }
    }
}
