use async_trait::async_trait;

use crate::Result;
use crate::models::{CrmAccount, EntityKind};
use crate::sync::models::{EntityPage, FetchedEntity};

/// Read access to the external CRM, authenticated per call.
///
/// Implementations return `Error::Unauthorized` when the CRM rejects the
/// access token so callers can refresh and retry.
#[async_trait]
pub trait CrmSource: Send + Sync {
    /// `Ok(None)` when the entity does not exist (any more) upstream.
    async fn fetch_entity(
        &self,
        access_token: &str,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<Option<FetchedEntity>>;

    async fn list_page(
        &self,
        access_token: &str,
        kind: EntityKind,
        after: Option<&str>,
    ) -> Result<EntityPage>;

    async fn current_account(&self, access_token: &str) -> Result<CrmAccount>;
}
