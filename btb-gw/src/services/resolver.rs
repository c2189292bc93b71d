//! Contact and base-deal resolution
//!
//! Dedup happens through a fixed precedence of identity signals: phones,
//! then emails, then company name. The first criterion that yields a CRM
//! row wins outright; criteria are never merged.

use crate::services::bitrix_client::{id_from, BitrixClient};
use crate::services::mapping::{FormMapping, SearchKeys};
use crate::services::submission::Submission;
use btb_common::config::Settings;
use btb_common::Result;
use serde_json::{json, Map, Value};

/// Lookup values derived from one submission; never persisted
#[derive(Debug, Clone, Default)]
pub struct SearchValues {
    pub inn: Option<String>,
    pub company: Option<String>,
    /// Canonical digit strings, first-seen order
    pub phones: Vec<String>,
    /// Lowercased, first-seen order
    pub emails: Vec<String>,
}

/// Reduce a raw phone to its canonical digit string. Russian 11-digit
/// numbers written with a leading 8 collapse onto the +7 form.
pub fn canonical_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    if digits.len() == 11 && digits.starts_with('8') {
        Some(format!("7{}", &digits[1..]))
    } else {
        Some(digits)
    }
}

/// Derive lookup values from a submission using the mapping's search keys
pub fn derive_search_values(submission: &Submission, keys: &SearchKeys) -> SearchValues {
    let first = |candidates: &[String]| {
        candidates
            .iter()
            .find_map(|key| submission.first_value(key))
    };

    let mut phones = Vec::new();
    for key in &keys.phone {
        for raw in submission.values(key) {
            if let Some(phone) = canonical_phone(&raw) {
                if !phones.contains(&phone) {
                    phones.push(phone);
                }
            }
        }
    }

    let mut emails = Vec::new();
    for key in &keys.email {
        for raw in submission.values(key) {
            let email = raw.to_lowercase();
            if !emails.contains(&email) {
                emails.push(email);
            }
        }
    }

    SearchValues {
        inn: first(&keys.inn),
        company: first(&keys.company),
        phones,
        emails,
    }
}

/// A resolved CRM contact
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: u64,
    pub company_id: Option<u64>,
}

/// A resolved CRM deal
#[derive(Debug, Clone)]
pub struct Deal {
    pub id: u64,
}

const CONTACT_SELECT: &[&str] = &["ID", "COMPANY_ID"];
const DEAL_SELECT: &[&str] = &["ID", "CATEGORY_ID", "STAGE_ID", "TITLE"];

/// Resolves contacts and pre-existing base deals against the CRM
pub struct EntityResolver<'a> {
    bitrix: &'a BitrixClient,
    settings: &'a Settings,
}

impl<'a> EntityResolver<'a> {
    pub fn new(bitrix: &'a BitrixClient, settings: &'a Settings) -> Self {
        Self { bitrix, settings }
    }

    /// Find a contact by phone, then email, then company name. The first
    /// matching criterion short-circuits.
    pub async fn find_contact(&self, search: &SearchValues) -> Result<Option<Contact>> {
        for phone in &search.phones {
            let rows = self
                .bitrix
                .list_contacts(json!({"PHONE": phone}), Some(CONTACT_SELECT))
                .await?;
            if let Some(contact) = rows.first().and_then(parse_contact) {
                return Ok(Some(contact));
            }
        }
        for email in &search.emails {
            let rows = self
                .bitrix
                .list_contacts(json!({"EMAIL": email}), Some(CONTACT_SELECT))
                .await?;
            if let Some(contact) = rows.first().and_then(parse_contact) {
                return Ok(Some(contact));
            }
        }
        if let Some(company) = &search.company {
            for field in &self.settings.contact_company_fields {
                let mut filter = Map::new();
                filter.insert(field.clone(), json!(company));
                let rows = self
                    .bitrix
                    .list_contacts(Value::Object(filter), Some(CONTACT_SELECT))
                    .await?;
                if let Some(contact) = rows.first().and_then(parse_contact) {
                    return Ok(Some(contact));
                }
            }
        }
        Ok(None)
    }

    /// Find a pre-existing deal in the base category: INN, then company
    /// name, then deals linked to the resolved contact or its company.
    /// First non-empty CRM result wins, newest row taken.
    pub async fn find_base_deal(&self, search: &SearchValues) -> Result<Option<Deal>> {
        let category = self.settings.base_category_id;

        if let Some(inn) = &search.inn {
            let mut filter = Map::new();
            filter.insert("CATEGORY_ID".to_string(), json!(category));
            filter.insert(self.settings.inn_field.clone(), json!(inn));
            let rows = self
                .bitrix
                .list_deals(Value::Object(filter), Some(DEAL_SELECT))
                .await?;
            if let Some(deal) = rows.first().and_then(parse_deal) {
                return Ok(Some(deal));
            }
        }

        if let Some(company) = &search.company {
            for field in &self.settings.deal_company_fields {
                let mut filter = Map::new();
                filter.insert("CATEGORY_ID".to_string(), json!(category));
                filter.insert(field.clone(), json!(company));
                let rows = self
                    .bitrix
                    .list_deals(Value::Object(filter), Some(DEAL_SELECT))
                    .await?;
                if let Some(deal) = rows.first().and_then(parse_deal) {
                    return Ok(Some(deal));
                }
            }
        }

        if let Some(contact) = self.find_contact(search).await? {
            let filter = json!({
                "CATEGORY_ID": category,
                "CONTACT_ID": contact.id,
            });
            let rows = self.bitrix.list_deals(filter, Some(DEAL_SELECT)).await?;
            if let Some(deal) = rows.first().and_then(parse_deal) {
                return Ok(Some(deal));
            }
            if let Some(company_id) = contact.company_id {
                let filter = json!({
                    "CATEGORY_ID": category,
                    "COMPANY_ID": company_id,
                });
                let rows = self.bitrix.list_deals(filter, Some(DEAL_SELECT)).await?;
                if let Some(deal) = rows.first().and_then(parse_deal) {
                    return Ok(Some(deal));
                }
            }
        }

        Ok(None)
    }

    /// Resolve the submission's contact, creating one when the mapped
    /// contact payload is non-empty. Returns (contact id, company id,
    /// whether a contact was created).
    pub async fn ensure_contact(
        &self,
        mapping: &FormMapping,
        submission: &Submission,
        search: &SearchValues,
    ) -> Result<(Option<u64>, Option<u64>, bool)> {
        if let Some(contact) = self.find_contact(search).await? {
            return Ok((Some(contact.id), contact.company_id, false));
        }

        let fields = build_contact_fields(mapping, submission, search);
        if fields.is_empty() {
            return Ok((None, None, false));
        }

        let contact_id = self.bitrix.create_contact(&fields).await?;
        Ok((Some(contact_id), None, true))
    }
}

/// Build the contact-creation payload from mapped fields, falling back to
/// the first search phone/email when the mapping produced none.
pub fn build_contact_fields(
    mapping: &FormMapping,
    submission: &Submission,
    search: &SearchValues,
) -> Map<String, Value> {
    let mut fields = Map::new();
    for (sub_key, crm_field) in &mapping.contact_fields {
        let Some(value) = submission.normalized_json(sub_key) else {
            continue;
        };
        match crm_field.as_str() {
            "PHONE" | "EMAIL" => {
                fields.insert(crm_field.clone(), multi_value_records(&value));
            }
            _ => {
                fields.insert(crm_field.clone(), value);
            }
        }
    }

    if !fields.contains_key("PHONE") {
        if let Some(phone) = search.phones.first() {
            fields.insert(
                "PHONE".to_string(),
                multi_value_records(&Value::String(phone.clone())),
            );
        }
    }
    if !fields.contains_key("EMAIL") {
        if let Some(email) = search.emails.first() {
            fields.insert(
                "EMAIL".to_string(),
                multi_value_records(&Value::String(email.clone())),
            );
        }
    }
    fields
}

/// Fold scalar or list values into Bitrix multi-value sub-records tagged as
/// work contacts.
fn multi_value_records(value: &Value) -> Value {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    Value::Array(
        items
            .into_iter()
            .map(|v| json!({"VALUE": v, "VALUE_TYPE": "WORK"}))
            .collect(),
    )
}

fn parse_contact(row: &Value) -> Option<Contact> {
    Some(Contact {
        id: id_from(&row["ID"])?,
        company_id: id_from(&row["COMPANY_ID"]),
    })
}

fn parse_deal(row: &Value) -> Option<Deal> {
    Some(Deal {
        id: id_from(&row["ID"])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mapping::FormKind;
    use std::collections::HashMap;

    fn sub(pairs: &[(&str, &str)]) -> Submission {
        Submission::from_pairs(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    fn mapping_with_contacts(contact_fields: &[(&str, &str)]) -> FormMapping {
        FormMapping {
            name: "f".into(),
            kind: FormKind::Primary,
            deal_fields: Vec::new(),
            contact_fields: contact_fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            participation_field: None,
            file_fields: HashMap::new(),
            search: SearchKeys::default(),
        }
    }

    #[test]
    fn phone_canonicalization_collapses_formats() {
        assert_eq!(
            canonical_phone("+7 (900) 123-45-67"),
            canonical_phone("89001234567")
        );
        assert_eq!(canonical_phone("89001234567").as_deref(), Some("79001234567"));
        assert_eq!(canonical_phone("not a phone"), None);
        // short numbers pass through untouched
        assert_eq!(canonical_phone("112").as_deref(), Some("112"));
    }

    #[test]
    fn search_values_dedup_preserving_order() {
        let submission = sub(&[
            ("phone", "+7 (900) 123-45-67"),
            ("phone", "89001234567"),
            ("phone2", "89995554433"),
            ("email", "User@Example.COM"),
        ]);
        let keys = SearchKeys {
            inn: vec![],
            company: vec![],
            phone: vec!["phone".into(), "phone2".into()],
            email: vec!["email".into()],
        };
        let values = derive_search_values(&submission, &keys);
        assert_eq!(values.phones, vec!["79001234567", "79995554433"]);
        assert_eq!(values.emails, vec!["user@example.com"]);
    }

    #[test]
    fn contact_payload_folds_phone_into_work_records() {
        let mapping = mapping_with_contacts(&[("name", "NAME"), ("phone", "PHONE")]);
        let submission = sub(&[("name", "Анна"), ("phone", "89001234567")]);
        let search = SearchValues::default();

        let fields = build_contact_fields(&mapping, &submission, &search);
        assert_eq!(fields["NAME"], "Анна");
        assert_eq!(fields["PHONE"][0]["VALUE"], "89001234567");
        assert_eq!(fields["PHONE"][0]["VALUE_TYPE"], "WORK");
    }

    #[test]
    fn contact_payload_falls_back_to_search_values() {
        let mapping = mapping_with_contacts(&[("name", "NAME")]);
        let submission = sub(&[("other", "x")]);
        let search = SearchValues {
            phones: vec!["79001234567".into()],
            emails: vec!["a@b.c".into()],
            ..SearchValues::default()
        };

        let fields = build_contact_fields(&mapping, &submission, &search);
        assert_eq!(fields["PHONE"][0]["VALUE"], "79001234567");
        assert_eq!(fields["EMAIL"][0]["VALUE"], "a@b.c");
    }

    #[test]
    fn empty_contact_payload_stays_empty() {
        let mapping = mapping_with_contacts(&[("name", "NAME")]);
        let submission = sub(&[("unrelated", "x")]);
        let fields = build_contact_fields(&mapping, &submission, &SearchValues::default());
        assert!(fields.is_empty());
    }
}
