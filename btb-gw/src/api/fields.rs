//! Cached Bitrix24 deal field schema

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct FieldsQuery {
    #[serde(default)]
    pub refresh: bool,
}

/// Fetch the deal field schema from Bitrix24 and persist it to the cache
/// file, non-ASCII labels kept verbatim.
pub async fn cache_deal_fields(state: &AppState) -> btb_common::Result<()> {
    let fields = state.bitrix.fetch_deal_fields().await?;
    let path = &state.settings.fields_cache;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(&fields)?)?;
    tracing::info!(path = %path.display(), "cached Bitrix24 deal field schema");
    Ok(())
}

/// GET /bitrix/fields
///
/// Serves the cached schema snapshot; `refresh=true` refetches first.
/// 503 until a snapshot exists.
pub async fn get_bitrix_fields(
    State(state): State<AppState>,
    Query(query): Query<FieldsQuery>,
) -> ApiResult<Json<Value>> {
    if query.refresh {
        cache_deal_fields(&state).await?;
    }
    let path = &state.settings.fields_cache;
    if !path.exists() {
        return Err(ApiError::ServiceUnavailable(
            "Bitrix24 deal field schema has not been cached yet".to_string(),
        ));
    }
    let text = std::fs::read_to_string(path)?;
    let fields: Value = serde_json::from_str(&text)
        .map_err(|e| ApiError::Internal(format!("corrupt fields cache: {e}")))?;
    Ok(Json(fields))
}

/// Build field-schema routes
pub fn fields_routes() -> Router<AppState> {
    Router::new().route("/bitrix/fields", get(get_bitrix_fields))
}
