//! Inbound submission normalization and upload staging
//!
//! Repeated form keys merge into ordered lists, single occurrences stay
//! scalar. Uploaded files are streamed into a per-request staging directory
//! before any network call; the directory is removed when the submission is
//! dropped, on every exit path.

use axum::extract::multipart::Multipart;
use btb_common::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Candidate payload keys carrying the Tilda form identity, tried in order
pub const FORM_IDENTITY_KEYS: &[&str] = &[
    "formname",
    "formid",
    "tildaformid",
    "tilda_form_id",
    "form_uid",
    "form_id",
    "lable",
];

/// A form value: scalar for single occurrences, list for repeated keys
#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    Text(String),
    Many(Vec<String>),
}

impl FormValue {
    pub fn to_json(&self) -> Value {
        match self {
            FormValue::Text(s) => Value::String(s.clone()),
            FormValue::Many(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
        }
    }
}

/// An uploaded file staged on local disk
#[derive(Debug)]
pub struct StagedUpload {
    /// Form field the file arrived under
    pub field: String,
    /// Sanitized file name
    pub file_name: String,
    pub path: PathBuf,
    pub content_type: Option<String>,
    pub recompressed: bool,
}

/// Request-scoped staging directory, removed on drop
#[derive(Debug)]
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    fn create(root: &Path) -> Result<Self> {
        let path = root.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove staging directory");
            }
        }
    }
}

/// One inbound submission: the multi-valued payload plus staged uploads
#[derive(Debug)]
pub struct Submission {
    fields: HashMap<String, FormValue>,
    pub uploads: Vec<StagedUpload>,
    _staging: Option<StagingDir>,
}

impl Submission {
    /// Build from already-decoded key/value pairs (form-encoded bodies)
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut fields = HashMap::new();
        for (key, value) in pairs {
            push_pair(&mut fields, key, value);
        }
        Self {
            fields,
            uploads: Vec::new(),
            _staging: None,
        }
    }

    /// Drain a multipart body, staging file parts under `staging_root`
    pub async fn from_multipart(mut multipart: Multipart, staging_root: &Path) -> Result<Self> {
        let staging = StagingDir::create(staging_root)?;
        let mut fields = HashMap::new();
        let mut uploads: Vec<StagedUpload> = Vec::new();

        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| Error::Validation(format!("malformed multipart body: {e}")))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if let Some(original_name) = field.file_name().map(str::to_string) {
                let content_type = field.content_type().map(str::to_string);
                let file_name = sanitize_file_name(&original_name);
                let path = staging
                    .path
                    .join(format!("{}_{}", uploads.len(), file_name));

                let mut out = tokio::fs::File::create(&path).await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| Error::Validation(format!("truncated upload '{name}': {e}")))?
                {
                    out.write_all(&chunk).await?;
                }
                out.flush().await?;

                uploads.push(StagedUpload {
                    field: name,
                    file_name,
                    path,
                    content_type,
                    recompressed: false,
                });
            } else {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::Validation(format!("unreadable field '{name}': {e}")))?;
                push_pair(&mut fields, name, text);
            }
        }
        Ok(Self {
            fields,
            uploads,
            _staging: Some(staging),
        })
    }

    /// Normalized value for a key, `None` when absent or empty after trimming
    pub fn value(&self, key: &str) -> Option<FormValue> {
        self.fields.get(key).and_then(normalize_value)
    }

    /// First normalized scalar for a key
    pub fn first_value(&self, key: &str) -> Option<String> {
        match self.value(key)? {
            FormValue::Text(s) => Some(s),
            FormValue::Many(items) => items.into_iter().next(),
        }
    }

    /// All normalized scalars for a key, in arrival order
    pub fn values(&self, key: &str) -> Vec<String> {
        match self.value(key) {
            None => Vec::new(),
            Some(FormValue::Text(s)) => vec![s],
            Some(FormValue::Many(items)) => items,
        }
    }

    /// Normalized value as JSON, for Bitrix field payloads
    pub fn normalized_json(&self, key: &str) -> Option<Value> {
        self.value(key).map(|v| v.to_json())
    }

    /// Staged uploads that arrived under the given form field
    pub fn uploads_for(&self, field: Option<&String>) -> Vec<&StagedUpload> {
        let Some(field) = field else {
            return Vec::new();
        };
        self.uploads.iter().filter(|u| &u.field == field).collect()
    }

    /// Raw payload as JSON for audit records; uploads appear as lists of
    /// file names under their field keys.
    pub fn payload_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        for (key, value) in &self.fields {
            obj.insert(key.clone(), value.to_json());
        }
        for upload in &self.uploads {
            let entry = obj
                .entry(upload.field.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(list) = entry {
                list.push(Value::String(upload.file_name.clone()));
            }
        }
        Value::Object(obj)
    }

    /// Re-encode staged files from the configured fields as JPEG. Failures
    /// leave the original file untouched and are only logged.
    pub fn recompress_uploads(&mut self, fields: &[String], quality: u8) {
        for upload in &mut self.uploads {
            if !fields.contains(&upload.field) {
                continue;
            }
            match recompress_to_jpeg(&upload.path, quality) {
                Ok(true) => {
                    upload.recompressed = true;
                    upload.content_type = Some("image/jpeg".to_string());
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        field = %upload.field,
                        file = %upload.file_name,
                        error = %e,
                        "image recompression skipped"
                    );
                }
            }
        }
    }
}

/// Merge a decoded pair into the multi-valued payload
fn push_pair(fields: &mut HashMap<String, FormValue>, key: String, value: String) {
    match fields.entry(key) {
        std::collections::hash_map::Entry::Occupied(mut entry) => match entry.get_mut() {
            FormValue::Many(list) => list.push(value),
            FormValue::Text(prev) => {
                let prev = prev.clone();
                *entry.get_mut() = FormValue::Many(vec![prev, value]);
            }
        },
        std::collections::hash_map::Entry::Vacant(entry) => {
            entry.insert(FormValue::Text(value));
        }
    }
}

/// Trim a string, `None` when nothing remains
pub fn normalize_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Normalize a form value: trim scalars, drop empty list entries, `None`
/// when nothing survives
pub fn normalize_value(value: &FormValue) -> Option<FormValue> {
    match value {
        FormValue::Text(s) => normalize_text(s).map(FormValue::Text),
        FormValue::Many(items) => {
            let kept: Vec<String> = items.iter().filter_map(|s| normalize_text(s)).collect();
            if kept.is_empty() {
                None
            } else {
                Some(FormValue::Many(kept))
            }
        }
    }
}

/// Resolve the form identity: a caller-supplied override wins, otherwise the
/// first non-empty candidate key; the result is passed through the alias
/// table.
pub fn resolve_form_identity(
    submission: &Submission,
    override_key: Option<&str>,
    aliases: &HashMap<String, String>,
) -> Result<String> {
    let raw = match override_key.and_then(normalize_text_opt) {
        Some(key) => key,
        None => FORM_IDENTITY_KEYS
            .iter()
            .find_map(|key| submission.first_value(key))
            .ok_or_else(|| {
                Error::Validation("cannot determine Tilda form identifier".to_string())
            })?,
    };
    Ok(aliases.get(&raw).cloned().unwrap_or(raw))
}

fn normalize_text_opt(value: &str) -> Option<String> {
    normalize_text(value)
}

/// Reduce a client-supplied file name to a safe character set
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| matches!(c, '.' | '_')) {
        "upload.bin".to_string()
    } else {
        cleaned
    }
}

/// Re-encode the file at `path` as JPEG, keeping the result only when it is
/// smaller than the original. Returns whether the file was replaced.
fn recompress_to_jpeg(path: &Path, quality: u8) -> anyhow::Result<bool> {
    let original_len = std::fs::metadata(path)?.len();
    let img = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;
    // JPEG has no alpha channel
    let img = image::DynamicImage::ImageRgb8(img.to_rgb8());

    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    img.write_with_encoder(encoder)?;

    if (buf.get_ref().len() as u64) < original_len {
        std::fs::write(path, buf.get_ref())?;
        Ok(true)
    } else {
        Ok(false)
    }
}
