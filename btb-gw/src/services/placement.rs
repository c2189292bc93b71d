//! Deal-scoped file placement
//!
//! Uploads staged files into a per-deal Disk folder and back-attaches the
//! resulting file ids to one deal field with a single update call.

use crate::services::bitrix_client::BitrixClient;
use crate::services::submission::StagedUpload;
use btb_common::Result;
use serde_json::{json, Map};

pub struct FilePlacement<'a> {
    bitrix: &'a BitrixClient,
}

impl<'a> FilePlacement<'a> {
    pub fn new(bitrix: &'a BitrixClient) -> Self {
        Self { bitrix }
    }

    /// Upload `files` into the deal's folder and write the collected ids to
    /// `target_field`. No files or no target field means no CRM calls at
    /// all. A single failed upload is skipped; the deal update happens only
    /// when at least one upload succeeded, and always as one call carrying
    /// the full id list.
    pub async fn place(
        &self,
        deal_id: u64,
        files: &[&StagedUpload],
        target_field: Option<&str>,
    ) -> Result<Vec<String>> {
        let Some(target_field) = target_field else {
            return Ok(Vec::new());
        };
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let parent = self.bitrix.ensure_uploads_parent().await?;
        let folder = self
            .bitrix
            .ensure_folder(&parent, &format!("deal_{deal_id}"))
            .await?;

        let mut file_ids = Vec::with_capacity(files.len());
        for file in files {
            match self
                .bitrix
                .upload_file(
                    &folder,
                    &file.path,
                    &file.file_name,
                    file.content_type.as_deref(),
                )
                .await
            {
                Ok(id) => file_ids.push(id),
                Err(e) => {
                    tracing::warn!(
                        deal_id,
                        file = %file.file_name,
                        error = %e,
                        "upload failed, file skipped"
                    );
                }
            }
        }

        if !file_ids.is_empty() {
            let mut fields = Map::new();
            fields.insert(target_field.to_string(), json!(file_ids));
            self.bitrix.update_deal(deal_id, &fields).await?;
        }
        Ok(file_ids)
    }
}
