//! Read access to mirrored CRM records: `/clients`, `/jobs`, ... and
//! `/{kind}/{external_id}`.

use crate::error::ApiError;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::{Path, Query};
use axum::routing::get;
use fieldsync_core::{EntityKind, Error as CoreError, ListQuery, SyncedEntity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct ListEntitiesQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct EntityList {
    pub kind: EntityKind,
    pub total: u64,
    pub items: Vec<SyncedEntity>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    EntityKind::ALL
        .into_iter()
        .fold(axum::Router::new(), |r, kind| {
            r.route(
                &format!("/{}", kind.plural()),
                get(
                    move |Extension(state): Extension<Arc<AppState>>,
                          Query(q): Query<ListEntitiesQuery>| {
                        list_entities(kind, state, q)
                    },
                ),
            )
            .route(
                &format!("/{}/{{external_id}}", kind.plural()),
                get(
                    move |Extension(state): Extension<Arc<AppState>>,
                          Path(external_id): Path<String>| {
                        get_entity(kind, state, external_id)
                    },
                ),
            )
        })
}

#[tracing::instrument(level = "debug", skip(state))]
pub async fn list_entities(
    kind: EntityKind,
    state: Arc<AppState>,
    q: ListEntitiesQuery,
) -> Result<Json<EntityList>, ApiError> {
    let items = state
        .store
        .list_entities(kind, ListQuery::new(q.limit, q.offset))
        .await?;
    let total = state.store.count_entities(kind).await?;
    Ok(Json(EntityList { kind, total, items }))
}

#[tracing::instrument(level = "debug", skip(state))]
pub async fn get_entity(
    kind: EntityKind,
    state: Arc<AppState>,
    external_id: String,
) -> Result<Json<SyncedEntity>, ApiError> {
    let entity = state
        .store
        .get_entity(kind, &external_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("{kind} {external_id}")))?;
    Ok(Json(entity))
}
