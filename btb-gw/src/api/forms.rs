//! Tilda form catalog, proxied from the Tilda API

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct FormsQuery {
    pub project_id: Option<u64>,
}

/// GET /tilda/forms
pub async fn list_tilda_forms(
    State(state): State<AppState>,
    Query(query): Query<FormsQuery>,
) -> ApiResult<Json<Value>> {
    let forms = state.tilda.list_forms(query.project_id).await?;
    Ok(Json(json!({"forms": forms})))
}

/// GET /tilda/forms/:form_id
pub async fn get_tilda_form(
    State(state): State<AppState>,
    Path(form_id): Path<u64>,
) -> ApiResult<Json<Value>> {
    let form = state.tilda.get_form(form_id).await?;
    Ok(Json(form))
}

/// Build form catalog routes
pub fn forms_routes() -> Router<AppState> {
    Router::new()
        .route("/tilda/forms", get(list_tilda_forms))
        .route("/tilda/forms/:form_id", get(get_tilda_form))
}
