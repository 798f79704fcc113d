//! OAuth token lifecycle for the external CRM.
//!
//! Every stored token belongs to exactly one user and one CRM account. The
//! manager hands out plaintext access tokens, refreshing them shortly before
//! expiry, and tears the connection down when the CRM rejects the refresh
//! token.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::models::{AccountId, CrmAccount, UserId};
use crate::secrets::TokenCipher;
use crate::store::Store;
use crate::tokens::models::{ConnectionStatus, RefreshError, StoredToken, TokenGrant};
use crate::{Error, Result};

/// Token endpoint of the external CRM.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenGrant, RefreshError>;
}

pub struct TokenManager {
    store: Arc<dyn Store>,
    cipher: TokenCipher,
    provider: Arc<dyn OAuthProvider>,
    skew: Duration,
    refresh_locks: DashMap<AccountId, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn Store>,
        cipher: TokenCipher,
        provider: Arc<dyn OAuthProvider>,
        skew: std::time::Duration,
    ) -> Self {
        Self {
            store,
            cipher,
            provider,
            skew: Duration::from_std(skew).unwrap_or_else(|_| Duration::minutes(5)),
            refresh_locks: DashMap::new(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn OAuthProvider> {
        &self.provider
    }

    /// Stores a fresh grant for `user_id` on `account`.
    ///
    /// Any other user's token for the same account is removed, as is any
    /// token this user held for a different account.
    #[tracing::instrument(level = "info", skip_all, fields(user_id = %user_id, account_id = %account.account_id))]
    pub async fn connect(
        &self,
        user_id: UserId,
        account: CrmAccount,
        grant: TokenGrant,
    ) -> Result<ConnectionStatus> {
        if self.store.get_user(user_id).await?.is_none() {
            return Err(Error::NotFound(format!("user {user_id}")));
        }

        let now = Utc::now();
        let token = StoredToken {
            user_id,
            account_id: account.account_id.clone(),
            access_ciphertext: self.cipher.encrypt_str(&grant.access_token)?,
            refresh_ciphertext: self.cipher.encrypt_str(&grant.refresh_token)?,
            expires_at: grant.expires_at,
            created_at: now,
            updated_at: now,
        };

        // Serialized with refreshes so a refresh in flight cannot overwrite this grant.
        let lock = self.lock_for(&account.account_id);
        let _guard = lock.lock().await;
        let displaced = self.store.replace_account_token(&token).await?;
        for other in &displaced {
            tracing::info!(displaced_user_id = %other, "crm account reconnected by another user");
        }

        let account = CrmAccount {
            connected_user_id: Some(user_id),
            updated_at: now,
            ..account
        };
        self.store.upsert_account(&account).await?;

        Ok(ConnectionStatus {
            connected: true,
            account_id: Some(account.account_id),
            account_name: Some(account.name),
            expires_at: Some(token.expires_at),
        })
    }

    /// Usable access token for the account, refreshed if it is about to expire.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn access_token_for_account(&self, account_id: &AccountId) -> Result<String> {
        let token = self.load_for_account(account_id).await?;
        if !self.needs_refresh(token.expires_at, Utc::now()) {
            return self.cipher.decrypt_str(&token.access_ciphertext);
        }

        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        // Another task may have refreshed while we waited.
        let token = self.load_for_account(account_id).await?;
        if !self.needs_refresh(token.expires_at, Utc::now()) {
            return self.cipher.decrypt_str(&token.access_ciphertext);
        }
        self.refresh_locked(token).await
    }

    /// Like `access_token_for_account`, resolved through the user's connection.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn access_token_for_user(&self, user_id: UserId) -> Result<(AccountId, String)> {
        let token = self
            .store
            .get_token_for_user(user_id)
            .await?
            .ok_or_else(|| {
                Error::ReconnectRequired(format!("user {user_id} has no crm connection"))
            })?;
        let access = self.access_token_for_account(&token.account_id).await?;
        Ok((token.account_id, access))
    }

    /// Refreshes after the CRM rejected `rejected_access_token`.
    ///
    /// If the stored token already differs from the rejected one, another task
    /// refreshed in the meantime and the current token is returned as is.
    #[tracing::instrument(level = "info", skip(self, rejected_access_token))]
    pub async fn force_refresh(
        &self,
        account_id: &AccountId,
        rejected_access_token: &str,
    ) -> Result<String> {
        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        let token = self.load_for_account(account_id).await?;
        let current = self.cipher.decrypt_str(&token.access_ciphertext)?;
        if current != rejected_access_token {
            return Ok(current);
        }
        self.refresh_locked(token).await
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn disconnect(&self, user_id: UserId) -> Result<bool> {
        let removed = self.store.delete_tokens_for_user(user_id).await?;
        Ok(removed > 0)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn status(&self, user_id: UserId) -> Result<ConnectionStatus> {
        let Some(token) = self.store.get_token_for_user(user_id).await? else {
            return Ok(ConnectionStatus::disconnected());
        };
        let account = self.store.get_account(&token.account_id).await?;
        Ok(ConnectionStatus {
            connected: true,
            account_name: account.map(|a| a.name),
            account_id: Some(token.account_id),
            expires_at: Some(token.expires_at),
        })
    }

    fn needs_refresh(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        expires_at - now <= self.skew
    }

    fn lock_for(&self, account_id: &AccountId) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .entry(account_id.clone())
            .or_default()
            .clone()
    }

    async fn load_for_account(&self, account_id: &AccountId) -> Result<StoredToken> {
        self.store
            .get_token_for_account(account_id)
            .await?
            .ok_or_else(|| {
                Error::ReconnectRequired(format!("no crm token stored for account {account_id}"))
            })
    }

    /// Caller must hold the account's refresh lock.
    async fn refresh_locked(&self, token: StoredToken) -> Result<String> {
        let refresh_token = self.cipher.decrypt_str(&token.refresh_ciphertext)?;
        match self.provider.refresh(&refresh_token).await {
            Ok(grant) => {
                // Some grants omit the refresh token; keep the one we have.
                let refresh_ciphertext = if grant.refresh_token.is_empty() {
                    token.refresh_ciphertext.clone()
                } else {
                    self.cipher.encrypt_str(&grant.refresh_token)?
                };
                let updated = StoredToken {
                    access_ciphertext: self.cipher.encrypt_str(&grant.access_token)?,
                    refresh_ciphertext,
                    expires_at: grant.expires_at,
                    updated_at: Utc::now(),
                    ..token
                };
                self.store.update_token(&updated).await?;
                tracing::info!(
                    account_id = %updated.account_id,
                    expires_at = %updated.expires_at,
                    "refreshed crm access token"
                );
                Ok(grant.access_token)
            }
            Err(RefreshError::InvalidGrant(msg)) => {
                tracing::warn!(
                    user_id = %token.user_id,
                    account_id = %token.account_id,
                    error = %msg,
                    "crm refresh token rejected; clearing connection"
                );
                // A reconnect may have stored a new grant since this token was read.
                if !self.store.delete_token_if_current(&token).await? {
                    tracing::info!(
                        account_id = %token.account_id,
                        "crm token replaced during refresh; keeping the new connection"
                    );
                }
                Err(Error::ReconnectRequired(format!(
                    "crm authorization for account {} was revoked: {msg}",
                    token.account_id
                )))
            }
            Err(RefreshError::Other(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserRecord;
    use crate::store::SqliteStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeProvider {
        refreshes: AtomicUsize,
        fail_with_invalid_grant: Mutex<bool>,
        /// Stored while the refresh call is outstanding.
        concurrent_reconnect: Mutex<Option<(Arc<SqliteStore>, StoredToken)>>,
    }

    #[async_trait]
    impl OAuthProvider for FakeProvider {
        async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
            Ok(grant(&format!("access-{code}"), Duration::hours(1)))
        }

        async fn refresh(
            &self,
            _refresh_token: &str,
        ) -> std::result::Result<TokenGrant, RefreshError> {
            let reconnect = self.concurrent_reconnect.lock().unwrap().take();
            if let Some((store, token)) = reconnect {
                store.replace_account_token(&token).await.unwrap();
            }
            if *self.fail_with_invalid_grant.lock().unwrap() {
                return Err(RefreshError::InvalidGrant("revoked".into()));
            }
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(grant(&format!("refreshed-{n}"), Duration::hours(1)))
        }
    }

    fn grant(access: &str, ttl: Duration) -> TokenGrant {
        TokenGrant {
            access_token: access.to_string(),
            refresh_token: format!("refresh-for-{access}"),
            expires_at: Utc::now() + ttl,
        }
    }

    fn account(id: &str) -> CrmAccount {
        CrmAccount {
            account_id: AccountId(id.to_string()),
            name: format!("Sparkle Cleaning {id}"),
            connected_user_id: None,
            updated_at: Utc::now(),
        }
    }

    async fn setup() -> (TokenManager, Arc<SqliteStore>, Arc<FakeProvider>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("t.db")).await.unwrap());
        let provider = Arc::new(FakeProvider::default());
        let manager = TokenManager::new(
            store.clone(),
            TokenCipher::new(&[7u8; 32]),
            provider.clone(),
            std::time::Duration::from_secs(300),
        );
        (manager, store, provider, dir)
    }

    async fn user(store: &SqliteStore, email: &str) -> UserId {
        let id = UserId(Uuid::new_v4());
        store
            .upsert_user(&UserRecord {
                user_id: id,
                email: email.to_string(),
                name: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let (manager, store, provider, _dir) = setup().await;
        let alice = user(&store, "alice@example.com").await;
        manager
            .connect(alice, account("acc"), grant("a1", Duration::hours(1)))
            .await
            .unwrap();

        let token = manager
            .access_token_for_account(&AccountId("acc".into()))
            .await
            .unwrap();
        assert_eq!(token, "a1");
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn token_inside_skew_window_is_refreshed_once() {
        let (manager, store, provider, _dir) = setup().await;
        let alice = user(&store, "alice@example.com").await;
        manager
            .connect(alice, account("acc"), grant("a1", Duration::minutes(4)))
            .await
            .unwrap();

        let acc = AccountId("acc".into());
        let (t1, t2) = tokio::join!(
            manager.access_token_for_account(&acc),
            manager.access_token_for_account(&acc)
        );
        assert_eq!(t1.unwrap(), "refreshed-1");
        assert_eq!(t2.unwrap(), "refreshed-1");
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_connector_wins() {
        let (manager, store, _provider, _dir) = setup().await;
        let alice = user(&store, "alice@example.com").await;
        let bob = user(&store, "bob@example.com").await;

        manager
            .connect(alice, account("acc"), grant("alice-token", Duration::hours(1)))
            .await
            .unwrap();
        manager
            .connect(bob, account("acc"), grant("bob-token", Duration::hours(1)))
            .await
            .unwrap();

        assert!(!manager.status(alice).await.unwrap().connected);
        assert!(manager.status(bob).await.unwrap().connected);
        let (_, token) = manager.access_token_for_user(bob).await.unwrap();
        assert_eq!(token, "bob-token");
        assert!(matches!(
            manager.access_token_for_user(alice).await,
            Err(Error::ReconnectRequired(_))
        ));
    }

    #[tokio::test]
    async fn invalid_grant_clears_the_connection() {
        let (manager, store, provider, _dir) = setup().await;
        let alice = user(&store, "alice@example.com").await;
        manager
            .connect(alice, account("acc"), grant("a1", Duration::seconds(30)))
            .await
            .unwrap();
        *provider.fail_with_invalid_grant.lock().unwrap() = true;

        let err = manager
            .access_token_for_account(&AccountId("acc".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReconnectRequired(_)));
        assert!(store.get_token_for_user(alice).await.unwrap().is_none());
        assert!(!manager.status(alice).await.unwrap().connected);
    }

    #[tokio::test]
    async fn invalid_grant_keeps_a_grant_stored_meanwhile() {
        let (manager, store, provider, _dir) = setup().await;
        let alice = user(&store, "alice@example.com").await;
        manager
            .connect(alice, account("acc"), grant("a1", Duration::seconds(30)))
            .await
            .unwrap();

        let cipher = TokenCipher::new(&[7u8; 32]);
        let now = Utc::now();
        let reconnected = StoredToken {
            user_id: alice,
            account_id: AccountId("acc-2".into()),
            access_ciphertext: cipher.encrypt_str("b1").unwrap(),
            refresh_ciphertext: cipher.encrypt_str("refresh-for-b1").unwrap(),
            expires_at: now + Duration::hours(1),
            created_at: now,
            updated_at: now,
        };
        *provider.concurrent_reconnect.lock().unwrap() = Some((store.clone(), reconnected));
        *provider.fail_with_invalid_grant.lock().unwrap() = true;

        let err = manager
            .access_token_for_account(&AccountId("acc".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReconnectRequired(_)));

        let kept = store.get_token_for_user(alice).await.unwrap().unwrap();
        assert_eq!(kept.account_id, AccountId("acc-2".into()));
        let access = manager
            .access_token_for_account(&AccountId("acc-2".into()))
            .await
            .unwrap();
        assert_eq!(access, "b1");
    }

    #[tokio::test]
    async fn force_refresh_skips_when_token_already_rotated() {
        let (manager, store, provider, _dir) = setup().await;
        let alice = user(&store, "alice@example.com").await;
        manager
            .connect(alice, account("acc"), grant("a1", Duration::hours(1)))
            .await
            .unwrap();
        let acc = AccountId("acc".into());

        let t = manager.force_refresh(&acc, "a1").await.unwrap();
        assert_eq!(t, "refreshed-1");
        // A second caller that also saw "a1" rejected gets the new token.
        let t = manager.force_refresh(&acc, "a1").await.unwrap();
        assert_eq!(t, "refreshed-1");
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_requires_known_user() {
        let (manager, _store, _provider, _dir) = setup().await;
        let err = manager
            .connect(UserId(Uuid::new_v4()), account("acc"), grant("x", Duration::hours(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn disconnect_reports_whether_anything_was_removed() {
        let (manager, store, _provider, _dir) = setup().await;
        let alice = user(&store, "alice@example.com").await;
        manager
            .connect(alice, account("acc"), grant("a1", Duration::hours(1)))
            .await
            .unwrap();
        assert!(manager.disconnect(alice).await.unwrap());
        assert!(!manager.disconnect(alice).await.unwrap());
    }
}
