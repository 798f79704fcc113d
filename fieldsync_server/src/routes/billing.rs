use crate::error::ApiError;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use fieldsync_core::billing::{BillingCustomer, BillingService, InvoicePayment, Payment};
use fieldsync_core::ListQuery;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct CreatePaymentRequest {
    /// Partial amount; defaults to the invoice's outstanding balance.
    #[serde(default)]
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListPaymentsQuery {
    pub invoice_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/billing/customers/{client_id}", post(ensure_customer))
        .route(
            "/billing/invoices/{invoice_id}/payments",
            post(create_invoice_payment),
        )
        .route("/billing/payments", get(list_payments))
}

fn billing(state: &AppState) -> Result<&BillingService, ApiError> {
    state.billing.as_ref().ok_or(ApiError::BillingDisabled)
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn ensure_customer(
    Extension(state): Extension<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> Result<Json<BillingCustomer>, ApiError> {
    Ok(Json(billing(&state)?.ensure_customer(&client_id).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn create_invoice_payment(
    Extension(state): Extension<Arc<AppState>>,
    Path(invoice_id): Path<String>,
    body: Option<Json<CreatePaymentRequest>>,
) -> Result<(StatusCode, Json<InvoicePayment>), ApiError> {
    let amount_cents = body.and_then(|Json(req)| req.amount_cents);
    let payment = billing(&state)?
        .create_invoice_payment(&invoice_id, amount_cents)
        .await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_payments(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<ListPaymentsQuery>,
) -> Result<Json<Vec<Payment>>, ApiError> {
    let payments = billing(&state)?
        .list_payments(q.invoice_id.as_deref(), ListQuery::new(q.limit, q.offset))
        .await?;
    Ok(Json(payments))
}
