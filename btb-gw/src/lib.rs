//! btb-gw library interface
//!
//! Exposes the router and application state for integration testing.

pub mod api;
pub mod error;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use axum::extract::DefaultBodyLimit;
use axum::Router;
use btb_common::audit::AuditLog;
use btb_common::config::Settings;
use btb_common::{Error, Result};
use chrono::{DateTime, Utc};
use services::bitrix_client::BitrixClient;
use services::mapping::MappingStore;
use services::tilda_client::TildaClient;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
///
/// Every collaborator is constructed once at startup and carried here; no
/// ambient singletons.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub bitrix: Arc<BitrixClient>,
    pub tilda: Arc<TildaClient>,
    pub mappings: Arc<MappingStore>,
    pub audit: Arc<AuditLog>,
    /// Plain client for outbound event forwarding
    pub http: reqwest::Client,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(settings: Settings) -> Result<Self> {
        let bitrix = BitrixClient::new(&settings)?;
        let tilda = TildaClient::new(&settings)?;
        let mappings = MappingStore::new(
            &settings.mapping_file,
            &settings.inn_field,
            &settings.title_field,
        );
        let audit = AuditLog::new(&settings.audit_log);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            settings: Arc::new(settings),
            bitrix: Arc::new(bitrix),
            tilda: Arc::new(tilda),
            mappings: Arc::new(mappings),
            audit: Arc::new(audit),
            http,
            startup_time: Utc::now(),
        })
    }
}

/// Upload bodies can carry several images; the axum default of 2 MiB is
/// far too small.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::webhook_routes())
        .merge(api::fields_routes())
        .merge(api::forms_routes())
        .merge(api::health_routes())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
