//! Per-submission deal fan-out
//!
//! Drives the state machine for primary-kind forms: base-deal transition,
//! participation extraction, contact resolution, then one deal per
//! participation category in extracted order. Categories are processed
//! strictly sequentially; a failed deal creation aborts the remaining
//! categories and already-created deals stay, with their audit records
//! already written.

use crate::services::bitrix_client::BitrixClient;
use crate::services::mapping::{FormKind, FormMapping};
use crate::services::placement::FilePlacement;
use crate::services::resolver::{derive_search_values, EntityResolver, SearchValues};
use crate::services::submission::Submission;
use btb_common::audit::{AuditEntry, AuditLog};
use btb_common::config::Settings;
use btb_common::{Error, Result};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Reserved file-group key for uploads shared by every category
const LINESHEET_GROUP: &str = "linesheet";

/// Aggregated result of one processed submission
#[derive(Debug, Default)]
pub struct SubmissionOutcome {
    /// Created deal ids, in category order
    pub deal_ids: Vec<u64>,
    /// Base deal moved to the won stage, when one matched
    pub base_deal_id: Option<u64>,
    pub contact_id: Option<u64>,
}

pub struct FanoutEngine {
    settings: Arc<Settings>,
    bitrix: Arc<BitrixClient>,
    audit: Arc<AuditLog>,
}

impl FanoutEngine {
    pub fn new(settings: Arc<Settings>, bitrix: Arc<BitrixClient>, audit: Arc<AuditLog>) -> Self {
        Self {
            settings,
            bitrix,
            audit,
        }
    }

    pub async fn process(
        &self,
        mapping: &FormMapping,
        submission: &Submission,
        form_key: &str,
    ) -> Result<SubmissionOutcome> {
        match mapping.kind {
            FormKind::Primary => self.process_primary(mapping, submission, form_key).await,
            FormKind::Secondary => self.process_secondary(mapping, submission, form_key).await,
        }
    }

    async fn process_primary(
        &self,
        mapping: &FormMapping,
        submission: &Submission,
        form_key: &str,
    ) -> Result<SubmissionOutcome> {
        let search = derive_search_values(submission, &mapping.search);
        let resolver = EntityResolver::new(&self.bitrix, &self.settings);
        let payload = submission.payload_json();
        let mut outcome = SubmissionOutcome::default();

        // Base-deal transition is independent of the fan-out below.
        if let Some(base_deal) = resolver.find_base_deal(&search).await? {
            let mut fields = Map::new();
            fields.insert(
                "STAGE_ID".to_string(),
                json!(self.settings.stage_base_won),
            );
            self.bitrix.update_deal(base_deal.id, &fields).await?;
            outcome.base_deal_id = Some(base_deal.id);
            self.audit.write(
                &AuditEntry::new(form_key, payload.clone())
                    .action("base_deal_won")
                    .deal_id(base_deal.id),
            )?;
            tracing::info!(deal_id = base_deal.id, form = form_key, "base deal won");
        }

        let participation_field = mapping.participation_field.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "form '{}' is primary but has no participation_field",
                mapping.name
            ))
        })?;
        let categories = extract_categories(
            &submission.values(participation_field),
            &self.settings.participation_keywords,
        );
        if categories.is_empty() {
            return Err(Error::Validation(format!(
                "no participation categories in field '{participation_field}'"
            )));
        }

        let (contact_id, company_id, contact_created) = resolver
            .ensure_contact(mapping, submission, &search)
            .await?;
        outcome.contact_id = contact_id;
        if contact_created {
            let entry = AuditEntry::new(form_key, payload.clone()).action("contact_created");
            let entry = match contact_id {
                Some(id) => entry.contact_id(id),
                None => entry,
            };
            self.audit.write(&entry)?;
        }

        for category in &categories {
            let deal_id = self
                .create_participation_deal(
                    mapping,
                    submission,
                    form_key,
                    &search,
                    category,
                    contact_id,
                    company_id,
                    &payload,
                )
                .await?;
            outcome.deal_ids.push(deal_id);
        }
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_participation_deal(
        &self,
        mapping: &FormMapping,
        submission: &Submission,
        form_key: &str,
        search: &SearchValues,
        category: &str,
        contact_id: Option<u64>,
        company_id: Option<u64>,
        payload: &Value,
    ) -> Result<u64> {
        let base = [
            (
                "CATEGORY_ID".to_string(),
                json!(self.settings.applications_category_id),
            ),
            (
                "STAGE_ID".to_string(),
                json!(self.settings.stage_applications_new),
            ),
            ("SOURCE_ID".to_string(), json!(form_key)),
        ];
        let mut fields = build_deal_fields(&base, mapping, submission);
        fields.insert(
            self.settings.title_field.clone(),
            json!(deal_title(&self.settings, search, submission, mapping, category)),
        );
        if let Some(company_id) = company_id {
            fields
                .entry("COMPANY_ID".to_string())
                .or_insert_with(|| json!(company_id));
        }
        if let Some(contact_id) = contact_id {
            fields.insert("CONTACT_ID".to_string(), json!(contact_id));
        }

        let deal_id = self.bitrix.create_deal(&fields).await?;
        tracing::info!(deal_id, category, form = form_key, "deal created");

        let file_groups = self
            .place_files(
                submission,
                mapping,
                deal_id,
                &[
                    (category, self.settings.category_file_fields.get(category)),
                    (
                        LINESHEET_GROUP,
                        self.settings.linesheet_file_field.as_ref(),
                    ),
                ],
            )
            .await?;

        self.audit.write(
            &AuditEntry::new(form_key, payload.clone())
                .action("deal_created")
                .category(category)
                .deal_id(deal_id)
                .mapped_fields(Value::Object(fields))
                .file_ids(Value::Object(file_groups)),
        )?;
        Ok(deal_id)
    }

    async fn process_secondary(
        &self,
        mapping: &FormMapping,
        submission: &Submission,
        form_key: &str,
    ) -> Result<SubmissionOutcome> {
        let search = derive_search_values(submission, &mapping.search);
        let resolver = EntityResolver::new(&self.bitrix, &self.settings);
        let payload = submission.payload_json();
        let mut outcome = SubmissionOutcome::default();

        let (contact_id, company_id, contact_created) = resolver
            .ensure_contact(mapping, submission, &search)
            .await?;
        outcome.contact_id = contact_id;
        if contact_created {
            let entry = AuditEntry::new(form_key, payload.clone()).action("contact_created");
            let entry = match contact_id {
                Some(id) => entry.contact_id(id),
                None => entry,
            };
            self.audit.write(&entry)?;
        }

        let base = [
            (
                "CATEGORY_ID".to_string(),
                json!(self.settings.secondary_category_id),
            ),
            (
                "STAGE_ID".to_string(),
                json!(self.settings.stage_secondary_new),
            ),
            ("SOURCE_ID".to_string(), json!(form_key)),
        ];
        let mut fields = build_deal_fields(&base, mapping, submission);
        let label = self.settings.secondary_title_label.clone();
        fields.insert(
            self.settings.title_field.clone(),
            json!(deal_title(&self.settings, &search, submission, mapping, &label)),
        );
        if let Some(company_id) = company_id {
            fields
                .entry("COMPANY_ID".to_string())
                .or_insert_with(|| json!(company_id));
        }
        if let Some(contact_id) = contact_id {
            fields.insert("CONTACT_ID".to_string(), json!(contact_id));
        }

        let deal_id = self.bitrix.create_deal(&fields).await?;
        tracing::info!(deal_id, form = form_key, "secondary deal created");
        outcome.deal_ids.push(deal_id);

        // No per-category loop here: place every configured file group.
        let mut groups: Vec<(&str, Option<&String>)> = Vec::new();
        for group in mapping.file_fields.keys() {
            let target = if group.as_str() == LINESHEET_GROUP {
                self.settings.linesheet_file_field.as_ref()
            } else {
                self.settings.category_file_fields.get(group)
            };
            groups.push((group.as_str(), target));
        }
        let file_groups = self
            .place_files(submission, mapping, deal_id, &groups)
            .await?;

        self.audit.write(
            &AuditEntry::new(form_key, payload)
                .action("deal_created")
                .category(label.as_str())
                .deal_id(deal_id)
                .mapped_fields(Value::Object(fields))
                .file_ids(Value::Object(file_groups)),
        )?;
        Ok(outcome)
    }

    /// Run file placement for each (group, target field) pair; returns the
    /// target field -> file ids map for the audit record.
    async fn place_files(
        &self,
        submission: &Submission,
        mapping: &FormMapping,
        deal_id: u64,
        groups: &[(&str, Option<&String>)],
    ) -> Result<Map<String, Value>> {
        let placement = FilePlacement::new(&self.bitrix);
        let mut written = Map::new();
        for (group, target_field) in groups {
            let files = submission.uploads_for(mapping.file_fields.get(*group));
            let ids = placement
                .place(deal_id, &files, target_field.map(String::as_str))
                .await?;
            if let (Some(target), false) = (target_field, ids.is_empty()) {
                written.insert((*target).clone(), json!(ids));
            }
        }
        Ok(written)
    }

}

/// Title = company name, else the mapped title submission field, else the
/// configured placeholder, joined with the category label.
pub fn deal_title(
    settings: &Settings,
    search: &SearchValues,
    submission: &Submission,
    mapping: &FormMapping,
    label: &str,
) -> String {
    let base = search
        .company
        .clone()
        .or_else(|| {
            mapping
                .deal_keys_for(&settings.title_field)
                .iter()
                .find_map(|key| submission.first_value(key))
        })
        .unwrap_or_else(|| settings.title_placeholder.clone());
    format!("{base} - {label}")
}

/// Split participation values on the delimiter set, match tokens against
/// the keyword vocabulary case-insensitively, and dedup preserving
/// first-seen order. The canonical vocabulary spelling is returned.
pub fn extract_categories(values: &[String], vocabulary: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        for token in value.split([',', ';', '/', '\n']) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let lowered = token.to_lowercase();
            if let Some(canonical) = vocabulary.iter().find(|k| k.to_lowercase() == lowered) {
                if !out.iter().any(|c| c == canonical) {
                    out.push(canonical.clone());
                }
            }
        }
    }
    out
}

/// Merge the base record with the mapping's deal fields. When both target
/// the same Bitrix field the values concatenate into a list, base value
/// first.
pub fn build_deal_fields(
    base: &[(String, Value)],
    mapping: &FormMapping,
    submission: &Submission,
) -> Map<String, Value> {
    let mut fields = Map::new();
    for (field, value) in base {
        fields.insert(field.clone(), value.clone());
    }
    for (sub_key, crm_field) in &mapping.deal_fields {
        let Some(value) = submission.normalized_json(sub_key) else {
            continue;
        };
        match fields.entry(crm_field.clone()) {
            serde_json::map::Entry::Vacant(entry) => {
                entry.insert(value);
            }
            serde_json::map::Entry::Occupied(mut entry) => {
                let mut merged = into_list(entry.get().clone());
                merged.extend(into_list(value));
                *entry.get_mut() = Value::Array(merged);
            }
        }
    }
    fields
}

fn into_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}
