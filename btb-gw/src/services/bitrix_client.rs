//! Bitrix24 REST client
//!
//! Thin wrapper over the inbound-webhook API. Every response body is JSON;
//! an `error` key in the body is a hard failure regardless of the transport
//! status. Disk folder lookups are memoized by (parent, name) for the
//! process lifetime.

use btb_common::config::Settings;
use btb_common::{Error, Result};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::RwLock;

/// Bitrix24 REST client with a process-lifetime folder memo
pub struct BitrixClient {
    http: reqwest::Client,
    base_url: String,
    disk_user_id: u64,
    disk_root_folder_name: String,
    storage_root: RwLock<Option<String>>,
    uploads_parent: RwLock<Option<String>>,
    folder_memo: RwLock<HashMap<String, String>>,
}

impl BitrixClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: settings
                .bitrix_webhook_base_url
                .trim_end_matches('/')
                .to_string(),
            disk_user_id: settings.disk_user_id,
            disk_root_folder_name: settings.disk_root_folder_name.clone(),
            storage_root: RwLock::new(None),
            uploads_parent: RwLock::new(None),
            folder_memo: RwLock::new(HashMap::new()),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value> {
        let response = self
            .http
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("{method}: {e}")))?;
        Self::decode(method, response).await
    }

    async fn call_get(&self, method: &str, params: &[(&str, String)]) -> Result<Value> {
        let response = self
            .http
            .get(self.method_url(method))
            .query(params)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("{method}: {e}")))?;
        Self::decode(method, response).await
    }

    async fn decode(method: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Upstream(format!("{method}: {e}")))?;
        let payload: Value = serde_json::from_slice(&bytes).map_err(|_| {
            Error::Upstream(format!(
                "{method}: non-JSON response (HTTP {})",
                status.as_u16()
            ))
        })?;
        // An error envelope wins over the transport status.
        if let Some(err) = payload.get("error") {
            let description = payload
                .get("error_description")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Err(Error::Upstream(format!("{method}: {description}")));
        }
        if !status.is_success() {
            return Err(Error::Upstream(format!(
                "{method}: HTTP {}",
                status.as_u16()
            )));
        }
        Ok(payload)
    }

    // --- CRM: deals -------------------------------------------------------

    pub async fn fetch_deal_fields(&self) -> Result<Value> {
        let data = self.call_get("crm.deal.fields", &[]).await?;
        Ok(data["result"].clone())
    }

    pub async fn create_deal(&self, fields: &Map<String, Value>) -> Result<u64> {
        let payload = json!({
            "fields": fields,
            "params": {"REGISTER_SONET_EVENT": "N"},
        });
        let data = self.call("crm.deal.add", payload).await?;
        id_from(&data["result"])
            .ok_or_else(|| Error::Upstream("crm.deal.add: missing deal id in result".to_string()))
    }

    pub async fn update_deal(&self, deal_id: u64, fields: &Map<String, Value>) -> Result<()> {
        let payload = json!({
            "id": deal_id,
            "fields": fields,
            "params": {"REGISTER_SONET_EVENT": "N"},
        });
        self.call("crm.deal.update", payload).await?;
        Ok(())
    }

    pub async fn get_deal(&self, deal_id: u64) -> Result<Value> {
        let data = self
            .call_get("crm.deal.get", &[("id", deal_id.to_string())])
            .await?;
        Ok(data["result"].clone())
    }

    /// List deals matching `filter`, newest first (Bitrix `ID DESC`)
    pub async fn list_deals(
        &self,
        filter: Value,
        select: Option<&[&str]>,
    ) -> Result<Vec<Value>> {
        let mut payload = json!({
            "filter": filter,
            "order": {"ID": "DESC"},
            "start": 0,
        });
        if let Some(select) = select {
            payload["select"] = json!(select);
        }
        let data = self.call("crm.deal.list", payload).await?;
        Ok(result_rows(&data))
    }

    // --- CRM: contacts ----------------------------------------------------

    pub async fn list_contacts(
        &self,
        filter: Value,
        select: Option<&[&str]>,
    ) -> Result<Vec<Value>> {
        let mut payload = json!({
            "filter": filter,
            "order": {"ID": "DESC"},
        });
        if let Some(select) = select {
            payload["select"] = json!(select);
        }
        let data = self.call("crm.contact.list", payload).await?;
        Ok(result_rows(&data))
    }

    pub async fn get_contact(&self, contact_id: u64) -> Result<Value> {
        let data = self
            .call_get("crm.contact.get", &[("id", contact_id.to_string())])
            .await?;
        Ok(data["result"].clone())
    }

    pub async fn create_contact(&self, fields: &Map<String, Value>) -> Result<u64> {
        let payload = json!({
            "fields": fields,
            "params": {"REGISTER_SONET_EVENT": "N"},
        });
        let data = self.call("crm.contact.add", payload).await?;
        id_from(&data["result"]).ok_or_else(|| {
            Error::Upstream("crm.contact.add: missing contact id in result".to_string())
        })
    }

    // --- Disk -------------------------------------------------------------

    async fn ensure_storage_root(&self) -> Result<String> {
        if let Some(id) = self.storage_root.read().await.clone() {
            return Ok(id);
        }
        let data = self
            .call("disk.storage.getforuser", json!({"id": self.disk_user_id}))
            .await?;
        let root_id = data["result"]["rootObjectId"].clone();
        let root_id = id_string(&root_id).ok_or_else(|| {
            Error::Upstream("disk.storage.getforuser: cannot resolve user storage".to_string())
        })?;
        *self.storage_root.write().await = Some(root_id.clone());
        Ok(root_id)
    }

    /// Folder under the Disk root holding all per-deal upload folders
    pub async fn ensure_uploads_parent(&self) -> Result<String> {
        if let Some(id) = self.uploads_parent.read().await.clone() {
            return Ok(id);
        }
        let root_id = self.ensure_storage_root().await?;
        let folder_id = self
            .ensure_folder(&root_id, &self.disk_root_folder_name)
            .await?;
        *self.uploads_parent.write().await = Some(folder_id.clone());
        Ok(folder_id)
    }

    /// Get-or-create a folder by name under `parent_id`. A concurrent
    /// duplicate create is benign: both callers end up with a usable folder.
    pub async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String> {
        let memo_key = format!("{parent_id}:{name}");
        if let Some(id) = self.folder_memo.read().await.get(&memo_key).cloned() {
            return Ok(id);
        }

        let data = self
            .call("disk.folder.getchildren", json!({"id": parent_id}))
            .await?;
        let mut folder_id = None;
        for entry in result_rows(&data) {
            if entry["TYPE"] == "folder" && entry["NAME"] == name {
                folder_id = id_string(&entry["ID"]);
                break;
            }
        }
        let folder_id = match folder_id {
            Some(id) => id,
            None => {
                let created = self
                    .call(
                        "disk.folder.add",
                        json!({"data": {"NAME": name, "PARENT_ID": parent_id}}),
                    )
                    .await?;
                id_string(&created["result"]["ID"]).ok_or_else(|| {
                    Error::Upstream("disk.folder.add: missing folder id in result".to_string())
                })?
            }
        };

        self.folder_memo
            .write()
            .await
            .insert(memo_key, folder_id.clone());
        Ok(folder_id)
    }

    pub async fn upload_file(
        &self,
        folder_id: &str,
        path: &Path,
        file_name: &str,
        content_type: Option<&str>,
    ) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let mut part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        if let Some(mime) = content_type {
            part = part
                .mime_str(mime)
                .map_err(|e| Error::Internal(format!("invalid content type {mime}: {e}")))?;
        }
        let form = reqwest::multipart::Form::new()
            .text("id", folder_id.to_string())
            .text("generateUniqueName", "true")
            .part("file", part);

        let response = self
            .http
            .post(self.method_url("disk.folder.uploadfile"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("disk.folder.uploadfile: {e}")))?;
        let data = Self::decode("disk.folder.uploadfile", response).await?;
        id_string(&data["result"]["ID"]).ok_or_else(|| {
            Error::Upstream("disk.folder.uploadfile: missing file id in result".to_string())
        })
    }
}

/// Rows of a Bitrix list response
fn result_rows(data: &Value) -> Vec<Value> {
    match data.get("result") {
        Some(Value::Array(rows)) => rows.clone(),
        _ => Vec::new(),
    }
}

/// Bitrix ids arrive as numbers or numeric strings depending on the method
pub fn id_from(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Same as [`id_from`] but keeps the id in its string form (Disk ids)
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}
