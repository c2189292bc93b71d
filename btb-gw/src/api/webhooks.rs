//! Webhook intake handlers
//!
//! Tilda submissions arrive as multipart or form-encoded bodies; Bitrix24
//! events arrive as JSON or form-encoded bodies. Both are audited before
//! anything else happens.

use axum::{
    extract::{FromRequest, Multipart, Path, Request, State},
    http::header::CONTENT_TYPE,
    routing::post,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::services::fanout::FanoutEngine;
use crate::services::forwarder::forward_event;
use crate::services::submission::{resolve_form_identity, Submission};
use crate::AppState;
use btb_common::audit::AuditEntry;

const BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Submission intake response
#[derive(Debug, Serialize)]
pub struct SubmissionResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deal_ids: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_deal_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

pub async fn tilda_webhook(
    State(state): State<AppState>,
    request: Request,
) -> ApiResult<Json<SubmissionResponse>> {
    process_tilda(state, None, request).await
}

pub async fn tilda_webhook_named(
    State(state): State<AppState>,
    Path(form_key): Path<String>,
    request: Request,
) -> ApiResult<Json<SubmissionResponse>> {
    process_tilda(state, Some(form_key), request).await
}

async fn process_tilda(
    state: AppState,
    forced_form_key: Option<String>,
    request: Request,
) -> ApiResult<Json<SubmissionResponse>> {
    let mut submission = parse_submission(&state, request).await?;
    submission.recompress_uploads(
        &state.settings.recompress_fields,
        state.settings.jpeg_quality,
    );

    let form_key = resolve_form_identity(
        &submission,
        forced_form_key.as_deref(),
        &state.settings.form_aliases,
    )?;

    let Some(mapping) = state.mappings.get_form(&form_key)? else {
        // Not configured is an accepted outcome, not an error.
        state
            .audit
            .write(&AuditEntry::new(&form_key, submission.payload_json()))?;
        tracing::info!(form = %form_key, "no mapping configured, submission accepted");
        return Ok(Json(SubmissionResponse {
            status: "ok".to_string(),
            deal_ids: Vec::new(),
            base_deal_id: None,
            note: Some(format!("mapping for form '{form_key}' is not configured")),
        }));
    };

    let engine = FanoutEngine::new(
        state.settings.clone(),
        state.bitrix.clone(),
        state.audit.clone(),
    );
    match engine.process(&mapping, &submission, &form_key).await {
        Ok(outcome) => Ok(Json(SubmissionResponse {
            status: "ok".to_string(),
            deal_ids: outcome.deal_ids,
            base_deal_id: outcome.base_deal_id,
            note: None,
        })),
        Err(err) => {
            if matches!(err, btb_common::Error::Upstream(_)) {
                state.audit.write(
                    &AuditEntry::new(&form_key, submission.payload_json())
                        .note(err.to_string()),
                )?;
            }
            Err(err.into())
        }
    }
}

/// Decode the request into a submission, staging any uploaded files
async fn parse_submission(state: &AppState, request: Request) -> ApiResult<Submission> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?;
        Ok(Submission::from_multipart(multipart, &state.settings.upload_tmp_dir).await?)
    } else {
        let bytes = axum::body::to_bytes(request.into_body(), BODY_LIMIT)
            .await
            .map_err(|e| ApiError::BadRequest(format!("unreadable body: {e}")))?;
        let pairs = url::form_urlencoded::parse(&bytes).into_owned();
        Ok(Submission::from_pairs(pairs))
    }
}

pub async fn b24_webhook(
    State(state): State<AppState>,
    request: Request,
) -> ApiResult<Json<Value>> {
    let payload = read_event_payload(request).await?;
    state.audit.write(&AuditEntry::new("bitrix", payload.clone()))?;
    let response = Json(json!({"status": "accepted"}));

    // Detached: forwarding failures never affect the caller's response.
    if let Some(url) = state.settings.outbound_webhook_url.clone() {
        let http = state.http.clone();
        let forward_fields = state.settings.forward_fields.clone();
        tokio::spawn(async move {
            if let Err(e) = forward_event(&http, &url, &forward_fields, &payload).await {
                tracing::warn!(error = %e, "failed to forward Bitrix24 event");
            }
        });
    }

    Ok(response)
}

/// Bitrix24 posts events as JSON or form-encoded depending on configuration
async fn read_event_payload(request: Request) -> ApiResult<Value> {
    let bytes = axum::body::to_bytes(request.into_body(), BODY_LIMIT)
        .await
        .map_err(|e| ApiError::BadRequest(format!("unreadable body: {e}")))?;

    if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
        if value.is_object() {
            return Ok(value);
        }
    }
    let mut obj = serde_json::Map::new();
    for (key, value) in url::form_urlencoded::parse(&bytes) {
        obj.insert(key.into_owned(), Value::String(value.into_owned()));
    }
    Ok(Value::Object(obj))
}

/// Build webhook routes
pub fn webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/webhook/tilda", post(tilda_webhook))
        .route("/webhook/tilda/:form_key", post(tilda_webhook_named))
        .route("/webhook/b24", post(b24_webhook))
}
