//! Append-only audit log
//!
//! One JSON object per line, non-ASCII text preserved verbatim. This file is
//! the only durable record of CRM side effects for submissions that return
//! nothing to the submitter, so write failures propagate to the caller
//! instead of being swallowed.

use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One audit record
#[derive(Debug, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Form identity or "bitrix" for CRM events
    pub source: String,
    pub payload_raw: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapped_fields: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<u64>,
    /// Bitrix file field -> uploaded file ids written to it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_ids: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AuditEntry {
    pub fn new(source: impl Into<String>, payload_raw: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            payload_raw,
            action: None,
            category: None,
            mapped_fields: None,
            deal_id: None,
            contact_id: None,
            file_ids: None,
            note: None,
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn mapped_fields(mut self, fields: Value) -> Self {
        self.mapped_fields = Some(fields);
        self
    }

    pub fn deal_id(mut self, id: u64) -> Self {
        self.deal_id = Some(id);
        self
    }

    pub fn contact_id(mut self, id: u64) -> Self {
        self.contact_id = Some(id);
        self
    }

    pub fn file_ids(mut self, ids: Value) -> Self {
        self.file_ids = Some(ids);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Appends audit records to a JSON-lines file
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, entry: &AuditEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}
