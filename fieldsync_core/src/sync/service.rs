use std::future::Future;
use std::sync::Arc;

use crate::models::{AccountId, EntityKind, UserId};
use crate::store::Store;
use crate::sync::models::{
    BackfillReport, EntityPage, FetchedEntity, ReceiptStatus, WebhookAction, WebhookEvent,
    WebhookOutcome, WebhookReceipt, WebhookTopic,
};
use crate::sync::traits::CrmSource;
use crate::tokens::TokenManager;
use crate::{Error, Result};

/// Webhook-driven and on-demand mirroring of CRM entities into the store.
#[derive(Clone)]
pub struct SyncService {
    store: Arc<dyn Store>,
    tokens: Arc<TokenManager>,
    source: Arc<dyn CrmSource>,
}

impl SyncService {
    pub fn new(store: Arc<dyn Store>, tokens: Arc<TokenManager>, source: Arc<dyn CrmSource>) -> Self {
        Self {
            store,
            tokens,
            source,
        }
    }

    /// Receive -> resolve token -> fetch -> upsert for one delivery.
    ///
    /// Redeliveries of an already processed change are skipped. A delivery
    /// whose earlier attempt failed, or was interrupted and left pending past
    /// `PENDING_RECEIPT_TIMEOUT_SECS`, is processed again.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(topic = %event.topic, account_id = %event.account_id, item_id = %event.item_id)
    )]
    pub async fn handle_webhook(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let receipt = WebhookReceipt::pending(event);
        if !self.store.record_webhook_receipt(&receipt).await? {
            let previous = self.store.get_webhook_receipt(&receipt.dedupe_key).await?;
            let Some(previous) = previous.filter(|r| r.is_retryable(receipt.received_at)) else {
                tracing::debug!("duplicate webhook delivery");
                return Ok(WebhookOutcome::Duplicate);
            };
            tracing::info!(previous_status = previous.status.as_str(), "retrying webhook delivery");
        }

        let result = self.process(event).await;
        match &result {
            Ok(outcome) => {
                self.store
                    .finish_webhook_receipt(&receipt.dedupe_key, outcome.receipt_status(), None)
                    .await?;
                tracing::info!(outcome = ?outcome, "webhook processed");
            }
            Err(err) => {
                let msg = err.to_string();
                self.store
                    .finish_webhook_receipt(&receipt.dedupe_key, ReceiptStatus::Failed, Some(&msg))
                    .await?;
                tracing::warn!(error = %msg, "webhook processing failed");
            }
        }
        result
    }

    async fn process(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let Some(topic) = WebhookTopic::parse(&event.topic) else {
            return Ok(WebhookOutcome::Ignored);
        };

        if topic.action == WebhookAction::Destroy {
            self.store.delete_entity(topic.kind, &event.item_id).await?;
            return Ok(WebhookOutcome::Deleted);
        }

        let source = self.source.clone();
        let kind = topic.kind;
        let item_id = event.item_id.clone();
        let fetched = self
            .with_token(&event.account_id, move |token| {
                let source = source.clone();
                let item_id = item_id.clone();
                async move { source.fetch_entity(&token, kind, &item_id).await }
            })
            .await;

        let fetched = match fetched {
            Ok(f) => f,
            Err(Error::ReconnectRequired(msg)) => {
                tracing::warn!(error = %msg, "no usable crm connection for webhook account");
                return Ok(WebhookOutcome::NoConnection);
            }
            Err(e) => return Err(e),
        };

        match fetched {
            Some(entity) => {
                self.upsert_fetched(entity, &event.account_id).await?;
                Ok(WebhookOutcome::Upserted)
            }
            None => {
                // Deleted upstream between the notification and our fetch.
                self.store.delete_entity(kind, &event.item_id).await?;
                Ok(WebhookOutcome::Deleted)
            }
        }
    }

    /// Pulls every entity of `kind` visible through the user's connection.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn backfill(&self, user_id: UserId, kind: EntityKind) -> Result<usize> {
        let (account_id, _) = self.tokens.access_token_for_user(user_id).await?;

        let mut after: Option<String> = None;
        let mut synced = 0usize;
        loop {
            let source = self.source.clone();
            let cursor = after.clone();
            let page: EntityPage = self
                .with_token(&account_id, move |token| {
                    let source = source.clone();
                    let cursor = cursor.clone();
                    async move { source.list_page(&token, kind, cursor.as_deref()).await }
                })
                .await?;

            for entity in page.entities {
                self.upsert_fetched(entity, &account_id).await?;
                synced += 1;
            }

            match page.next_cursor {
                Some(next) if !next.is_empty() && after.as_deref() != Some(next.as_str()) => {
                    after = Some(next);
                }
                Some(next) if after.as_deref() == Some(next.as_str()) => {
                    tracing::warn!(cursor = %next, "crm returned the same cursor twice; stopping");
                    break;
                }
                _ => break,
            }
        }

        tracing::info!(synced, "backfill complete");
        Ok(synced)
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn backfill_all(&self, user_id: UserId) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();
        for kind in EntityKind::ALL {
            let n = self.backfill(user_id, kind).await?;
            report.counts.insert(kind, n);
        }
        Ok(report)
    }

    async fn upsert_fetched(&self, entity: FetchedEntity, account_id: &AccountId) -> Result<()> {
        let synced = entity.into_synced(account_id.clone());
        self.store.upsert_entity(&synced).await
    }

    /// Runs `call` with the account's access token, retrying once with a
    /// forced refresh when the CRM answers unauthorized.
    async fn with_token<T, F, Fut>(&self, account_id: &AccountId, mut call: F) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.tokens.access_token_for_account(account_id).await?;
        match call(token.clone()).await {
            Err(e) if e.is_unauthorized() => {
                tracing::info!("crm rejected access token; forcing refresh");
                let fresh = self.tokens.force_refresh(account_id, &token).await?;
                match call(fresh).await {
                    Err(e) if e.is_unauthorized() => Err(Error::ReconnectRequired(format!(
                        "crm rejected refreshed token for account {account_id}"
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrmAccount, UserRecord};
    use crate::secrets::TokenCipher;
    use crate::store::SqliteStore;
    use crate::tokens::{OAuthProvider, RefreshError, TokenGrant};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct StaticProvider;

    #[async_trait]
    impl OAuthProvider for StaticProvider {
        async fn exchange_code(&self, _code: &str) -> Result<TokenGrant> {
            unreachable!("not used")
        }

        async fn refresh(&self, _rt: &str) -> std::result::Result<TokenGrant, RefreshError> {
            Ok(TokenGrant {
                access_token: "fresh".into(),
                refresh_token: "rt2".into(),
                expires_at: Utc::now() + Duration::hours(1),
            })
        }
    }

    #[derive(Default)]
    struct FakeCrm {
        entities: Mutex<HashMap<(EntityKind, String), FetchedEntity>>,
        /// Tokens the fake CRM accepts.
        valid_tokens: Mutex<Vec<String>>,
        fetches: AtomicUsize,
        page_size: usize,
    }

    impl FakeCrm {
        fn put(&self, kind: EntityKind, id: &str, title: &str) {
            self.entities.lock().unwrap().insert(
                (kind, id.to_string()),
                FetchedEntity {
                    kind,
                    external_id: id.to_string(),
                    data: serde_json::json!({ "id": id, "title": title }),
                    occurred_at: Some(Utc::now()),
                    remote_updated_at: Some(Utc::now()),
                },
            );
        }

        fn check(&self, token: &str) -> Result<()> {
            if self.valid_tokens.lock().unwrap().iter().any(|t| t == token) {
                Ok(())
            } else {
                Err(Error::Unauthorized("bad token".into()))
            }
        }
    }

    #[async_trait]
    impl CrmSource for FakeCrm {
        async fn fetch_entity(
            &self,
            access_token: &str,
            kind: EntityKind,
            external_id: &str,
        ) -> Result<Option<FetchedEntity>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.check(access_token)?;
            Ok(self
                .entities
                .lock()
                .unwrap()
                .get(&(kind, external_id.to_string()))
                .cloned())
        }

        async fn list_page(
            &self,
            access_token: &str,
            kind: EntityKind,
            after: Option<&str>,
        ) -> Result<EntityPage> {
            self.check(access_token)?;
            let mut all: Vec<FetchedEntity> = self
                .entities
                .lock()
                .unwrap()
                .values()
                .filter(|e| e.kind == kind)
                .cloned()
                .collect();
            all.sort_by(|a, b| a.external_id.cmp(&b.external_id));
            let start = after.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
            let end = (start + self.page_size).min(all.len());
            Ok(EntityPage {
                entities: all[start..end].to_vec(),
                next_cursor: (end < all.len()).then(|| end.to_string()),
            })
        }

        async fn current_account(&self, _access_token: &str) -> Result<CrmAccount> {
            unreachable!("not used")
        }
    }

    struct Harness {
        sync: SyncService,
        store: Arc<SqliteStore>,
        crm: Arc<FakeCrm>,
        user: UserId,
        _dir: tempfile::TempDir,
    }

    async fn harness(initial_token: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("s.db")).await.unwrap());
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            TokenCipher::new(&[3u8; 32]),
            Arc::new(StaticProvider),
            std::time::Duration::from_secs(300),
        ));
        let crm = Arc::new(FakeCrm {
            page_size: 2,
            ..Default::default()
        });
        crm.valid_tokens.lock().unwrap().push("fresh".into());

        let user = UserId(Uuid::new_v4());
        store
            .upsert_user(&UserRecord {
                user_id: user,
                email: "ops@example.com".into(),
                name: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        tokens
            .connect(
                user,
                CrmAccount {
                    account_id: AccountId("acc".into()),
                    name: "Sparkle".into(),
                    connected_user_id: None,
                    updated_at: Utc::now(),
                },
                TokenGrant {
                    access_token: initial_token.into(),
                    refresh_token: "rt".into(),
                    expires_at: Utc::now() + Duration::hours(1),
                },
            )
            .await
            .unwrap();

        Harness {
            sync: SyncService::new(store.clone(), tokens, crm.clone()),
            store,
            crm,
            user,
            _dir: dir,
        }
    }

    fn event(topic: &str, item: &str) -> WebhookEvent {
        WebhookEvent {
            topic: topic.into(),
            account_id: AccountId("acc".into()),
            item_id: item.into(),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn webhook_upserts_fetched_entity() {
        let h = harness("fresh").await;
        h.crm.put(EntityKind::Client, "c-1", "Acme Offices");

        let out = h.sync.handle_webhook(&event("CLIENT_CREATE", "c-1")).await.unwrap();
        assert_eq!(out, WebhookOutcome::Upserted);
        let stored = h.store.get_entity(EntityKind::Client, "c-1").await.unwrap().unwrap();
        assert_eq!(stored.data["title"], "Acme Offices");
        assert_eq!(stored.account_id, AccountId("acc".into()));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_skipped() {
        let h = harness("fresh").await;
        h.crm.put(EntityKind::Job, "j-1", "Weekly clean");
        let ev = event("JOB_UPDATE", "j-1");

        h.sync.handle_webhook(&ev).await.unwrap();
        let out = h.sync.handle_webhook(&ev).await.unwrap();
        assert_eq!(out, WebhookOutcome::Duplicate);
        assert_eq!(h.crm.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interrupted_delivery_is_retried_once_stale() {
        let h = harness("fresh").await;
        h.crm.put(EntityKind::Quote, "q-1", "Deep clean");
        let ev = event("QUOTE_CREATE", "q-1");

        let mut stale = WebhookReceipt::pending(&ev);
        stale.received_at = Utc::now() - Duration::hours(1);
        assert!(h.store.record_webhook_receipt(&stale).await.unwrap());

        let out = h.sync.handle_webhook(&ev).await.unwrap();
        assert_eq!(out, WebhookOutcome::Upserted);
        assert!(h.store.get_entity(EntityKind::Quote, "q-1").await.unwrap().is_some());
        let receipt = h.store.get_webhook_receipt(&ev.dedupe_key()).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Done);
    }

    #[tokio::test]
    async fn recent_pending_delivery_counts_as_in_flight() {
        let h = harness("fresh").await;
        h.crm.put(EntityKind::Quote, "q-2", "Windows");
        let ev = event("QUOTE_UPDATE", "q-2");
        assert!(h.store.record_webhook_receipt(&WebhookReceipt::pending(&ev)).await.unwrap());

        let out = h.sync.handle_webhook(&ev).await.unwrap();
        assert_eq!(out, WebhookOutcome::Duplicate);
        assert_eq!(h.crm.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unauthorized_fetch_is_retried_after_forced_refresh() {
        let h = harness("stale").await;
        h.crm.put(EntityKind::Visit, "v-1", "Move-out");

        let out = h.sync.handle_webhook(&event("VISIT_COMPLETE", "v-1")).await.unwrap();
        assert_eq!(out, WebhookOutcome::Upserted);
        assert_eq!(h.crm.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repeated_unauthorized_asks_for_reconnect() {
        let h = harness("stale").await;
        h.crm.valid_tokens.lock().unwrap().clear();
        h.crm.put(EntityKind::Quote, "q-1", "Office quote");

        let out = h.sync.handle_webhook(&event("QUOTE_CREATE", "q-1")).await.unwrap();
        assert_eq!(out, WebhookOutcome::NoConnection);
        assert!(h.store.get_entity(EntityKind::Quote, "q-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn destroy_and_missing_upstream_delete_locally() {
        let h = harness("fresh").await;
        h.crm.put(EntityKind::Invoice, "i-1", "Invoice 1");
        h.crm.put(EntityKind::Invoice, "i-2", "Invoice 2");
        h.sync.handle_webhook(&event("INVOICE_CREATE", "i-1")).await.unwrap();
        h.sync.handle_webhook(&event("INVOICE_CREATE", "i-2")).await.unwrap();

        let out = h.sync.handle_webhook(&event("INVOICE_DESTROY", "i-1")).await.unwrap();
        assert_eq!(out, WebhookOutcome::Deleted);
        assert!(h.store.get_entity(EntityKind::Invoice, "i-1").await.unwrap().is_none());

        h.crm.entities.lock().unwrap().clear();
        let out = h.sync.handle_webhook(&event("INVOICE_UPDATE", "i-2")).await.unwrap();
        assert_eq!(out, WebhookOutcome::Deleted);
        assert_eq!(h.store.count_entities(EntityKind::Invoice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_topics_are_ignored() {
        let h = harness("fresh").await;
        let out = h.sync.handle_webhook(&event("APP_CONNECT", "x")).await.unwrap();
        assert_eq!(out, WebhookOutcome::Ignored);
        assert_eq!(h.crm.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn backfill_walks_all_pages() {
        let h = harness("fresh").await;
        for i in 0..5 {
            h.crm.put(EntityKind::Timesheet, &format!("t-{i}"), "shift");
        }
        h.crm.put(EntityKind::Client, "c-1", "Acme");

        let n = h.sync.backfill(h.user, EntityKind::Timesheet).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(h.store.count_entities(EntityKind::Timesheet).await.unwrap(), 5);

        let report = h.sync.backfill_all(h.user).await.unwrap();
        assert_eq!(report.total(), 6);
        assert_eq!(report.counts[&EntityKind::Client], 1);
    }
}
