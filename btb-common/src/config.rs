//! Settings loading
//!
//! Resolution order: CLI overrides (applied by the binary) take precedence
//! over environment variables, which take precedence over the TOML file,
//! which takes precedence over compiled defaults.

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const DEFAULT_SETTINGS_FILE: &str = "btb.toml";

/// Gateway settings
///
/// Every field has a compiled default except `bitrix_webhook_base_url`,
/// which must be supplied via the TOML file or `BTB_BITRIX_WEBHOOK_BASE_URL`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the HTTP server binds to
    pub listen_addr: String,
    /// Base URL of the Bitrix24 inbound webhook (includes user id and token)
    pub bitrix_webhook_base_url: String,
    /// Where Bitrix24 events are forwarded to; forwarding is off when unset
    pub outbound_webhook_url: Option<String>,
    /// Restrict forwarded event payloads to these fields; empty = forward all
    pub forward_fields: Vec<String>,
    pub tilda_api_base_url: String,
    pub tilda_public_key: Option<String>,
    pub tilda_secret_key: Option<String>,
    pub tilda_project_id: Option<u64>,
    /// Per-form field mapping file, hot-reloaded on modification
    pub mapping_file: PathBuf,
    /// Append-only audit log (JSON lines)
    pub audit_log: PathBuf,
    /// Cached snapshot of the Bitrix24 deal field schema
    pub fields_cache: PathBuf,
    /// Root for per-request upload staging directories
    pub upload_tmp_dir: PathBuf,
    pub request_timeout_secs: u64,

    /// Category holding pre-existing "base" deals
    pub base_category_id: u64,
    /// Category participation deals are created under
    pub applications_category_id: u64,
    /// Category for secondary-kind form submissions
    pub secondary_category_id: u64,
    pub stage_base_won: String,
    pub stage_applications_new: String,
    pub stage_secondary_new: String,

    /// Participation category keyword -> Bitrix deal field holding its file ids
    pub category_file_fields: HashMap<String, String>,
    /// Bitrix deal field holding linesheet file ids, shared across categories
    pub linesheet_file_field: Option<String>,
    pub inn_field: String,
    pub title_field: String,
    /// Deal fields tried in order when matching base deals by company name
    pub deal_company_fields: Vec<String>,
    /// Contact fields tried in order when matching contacts by company name
    pub contact_company_fields: Vec<String>,

    pub disk_user_id: u64,
    /// Folder under the Disk root that holds all per-deal upload folders
    pub disk_root_folder_name: String,

    /// Participation keyword vocabulary, canonical spelling
    pub participation_keywords: Vec<String>,
    /// Upload fields whose files are re-encoded as JPEG before upload
    pub recompress_fields: Vec<String>,
    pub jpeg_quality: u8,
    /// Title fallback when neither company nor mapped title field is present
    pub title_placeholder: String,
    /// Secondary-kind deals carry this label instead of a participation category
    pub secondary_title_label: String,
    /// Legacy form identifier -> canonical mapping-file key
    pub form_aliases: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            bitrix_webhook_base_url: String::new(),
            outbound_webhook_url: None,
            forward_fields: Vec::new(),
            tilda_api_base_url: "https://api.tilda.cc/".to_string(),
            tilda_public_key: None,
            tilda_secret_key: None,
            tilda_project_id: None,
            mapping_file: PathBuf::from("mapping.json"),
            audit_log: PathBuf::from("data/events.log"),
            fields_cache: PathBuf::from("data/bitrix_fields.json"),
            upload_tmp_dir: PathBuf::from("data/tmp_uploads"),
            request_timeout_secs: 15,
            base_category_id: 6,
            applications_category_id: 8,
            secondary_category_id: 12,
            stage_base_won: "C6:WON".to_string(),
            stage_applications_new: "C8:NEW".to_string(),
            stage_secondary_new: "C12:NEW".to_string(),
            category_file_fields: HashMap::from([
                ("Показ".to_string(), "UF_CRM_1764235976815".to_string()),
                ("Маркет".to_string(), "UF_CRM_1764236005770".to_string()),
            ]),
            linesheet_file_field: Some("UF_CRM_1764236031248".to_string()),
            inn_field: "UF_INN".to_string(),
            title_field: "TITLE".to_string(),
            deal_company_fields: vec!["TITLE".to_string()],
            contact_company_fields: vec!["COMPANY_TITLE".to_string()],
            disk_user_id: 1,
            disk_root_folder_name: "TildaUploads".to_string(),
            participation_keywords: vec![
                "Показ".to_string(),
                "Маркет".to_string(),
                "Шоурум".to_string(),
            ],
            recompress_fields: Vec::new(),
            jpeg_quality: 80,
            title_placeholder: "Заявка с Tilda".to_string(),
            secondary_title_label: "Сток".to_string(),
            form_aliases: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from the given TOML file (or `btb.toml` when present),
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = Path::new(DEFAULT_SETTINGS_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Settings::default()
                }
            }
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings file {}: {e}", path.display()))
        })?;
        toml::from_str(&text).map_err(|e| {
            Error::Config(format!("malformed settings file {}: {e}", path.display()))
        })
    }

    fn validate(&self) -> Result<()> {
        if self.bitrix_webhook_base_url.trim().is_empty() {
            return Err(Error::Config(
                "bitrix_webhook_base_url is not set (TOML key or BTB_BITRIX_WEBHOOK_BASE_URL)"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        if let Some(v) = var("BTB_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = var("BTB_BITRIX_WEBHOOK_BASE_URL") {
            self.bitrix_webhook_base_url = v;
        }
        if let Some(v) = var("BTB_OUTBOUND_WEBHOOK_URL") {
            self.outbound_webhook_url = Some(v);
        }
        if let Some(v) = var("BTB_FORWARD_FIELDS") {
            self.forward_fields = split_csv(&v);
        }
        if let Some(v) = var("BTB_TILDA_PUBLIC_KEY") {
            self.tilda_public_key = Some(v);
        }
        if let Some(v) = var("BTB_TILDA_SECRET_KEY") {
            self.tilda_secret_key = Some(v);
        }
        if let Some(v) = var("BTB_TILDA_PROJECT_ID") {
            self.tilda_project_id = v.parse().ok();
        }
        if let Some(v) = var("BTB_MAPPING_FILE") {
            self.mapping_file = PathBuf::from(v);
        }
        if let Some(v) = var("BTB_AUDIT_LOG") {
            self.audit_log = PathBuf::from(v);
        }
        if let Some(v) = var("BTB_FIELDS_CACHE") {
            self.fields_cache = PathBuf::from(v);
        }
        if let Some(v) = var("BTB_UPLOAD_TMP_DIR") {
            self.upload_tmp_dir = PathBuf::from(v);
        }
        if let Some(v) = var("BTB_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.request_timeout_secs = secs;
            }
        }
    }
}

/// Split a comma-separated list, trimming entries and dropping empties
pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
