//! Archive browsing, served from the lineage store (the committed view).

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::error::ApiError;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct BrowseQuery {
    /// `YYYYMM`; omit to list available months
    pub month: Option<String>,
}

/// GET /archives - Months when omitted, committed entries for one month
/// otherwise.
pub async fn browse_archives(
    State(state): State<AppState>,
    Query(query): Query<BrowseQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match query.month {
        None => {
            let months = state.store.months_with_archives().await?;
            Ok(Json(serde_json::json!({ "months": months })))
        }
        Some(month) => {
            let entries = state.store.list_month(&month).await?;
            Ok(Json(serde_json::json!({ "month": month, "entries": entries })))
        }
    }
}
