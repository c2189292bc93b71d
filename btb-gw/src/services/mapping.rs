//! Per-form field mapping configuration
//!
//! Mappings live in a single JSON file keyed by form identity. The file is
//! reparsed wholesale whenever its modification time advances, and the cache
//! is swapped atomically so readers never observe a half-built state.

use btb_common::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

/// Which pipeline a form's submissions go through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormKind {
    /// Full reconciliation: dedup, base-deal transition, per-category fan-out
    Primary,
    /// Single deal in the secondary category, no fan-out
    Secondary,
}

/// Submission keys used to derive lookup values
#[derive(Debug, Clone, Default)]
pub struct SearchKeys {
    pub inn: Vec<String>,
    pub company: Vec<String>,
    pub phone: Vec<String>,
    pub email: Vec<String>,
}

/// Immutable mapping snapshot for one form
#[derive(Debug, Clone)]
pub struct FormMapping {
    pub name: String,
    pub kind: FormKind,
    /// Submission key -> Bitrix deal field, in file order
    pub deal_fields: Vec<(String, String)>,
    /// Submission key -> Bitrix contact field
    pub contact_fields: Vec<(String, String)>,
    /// Submission field whose value names participation categories
    pub participation_field: Option<String>,
    /// Category keyword (or "linesheet") -> submission upload field
    pub file_fields: HashMap<String, String>,
    pub search: SearchKeys,
}

impl FormMapping {
    /// Submission keys mapped to the given Bitrix deal field
    pub fn deal_keys_for(&self, bitrix_field: &str) -> Vec<String> {
        self.deal_fields
            .iter()
            .filter(|(_, v)| v == bitrix_field)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Submission keys mapped to the given Bitrix contact field
    pub fn contact_keys_for(&self, bitrix_field: &str) -> Vec<String> {
        self.contact_fields
            .iter()
            .filter(|(_, v)| v == bitrix_field)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

struct CacheState {
    mtime: SystemTime,
    forms: HashMap<String, Arc<FormMapping>>,
}

/// Hot-reloading mapping store
pub struct MappingStore {
    path: PathBuf,
    inn_field: String,
    title_field: String,
    cache: RwLock<Option<CacheState>>,
}

impl MappingStore {
    pub fn new(path: impl Into<PathBuf>, inn_field: &str, title_field: &str) -> Self {
        Self {
            path: path.into(),
            inn_field: inn_field.to_string(),
            title_field: title_field.to_string(),
            cache: RwLock::new(None),
        }
    }

    /// Look up the mapping for a form identity, reloading the file first if
    /// it changed on disk. `Ok(None)` means the form is not configured.
    pub fn get_form(&self, form_key: &str) -> Result<Option<Arc<FormMapping>>> {
        self.ensure_fresh()?;
        let guard = self
            .cache
            .read()
            .map_err(|_| Error::Internal("mapping cache lock poisoned".to_string()))?;
        Ok(guard
            .as_ref()
            .and_then(|state| state.forms.get(form_key).cloned()))
    }

    fn ensure_fresh(&self) -> Result<()> {
        let metadata = std::fs::metadata(&self.path).map_err(|e| {
            Error::Config(format!("mapping file {}: {e}", self.path.display()))
        })?;
        let mtime = metadata.modified()?;

        let stale = {
            let guard = self
                .cache
                .read()
                .map_err(|_| Error::Internal("mapping cache lock poisoned".to_string()))?;
            match guard.as_ref() {
                None => true,
                Some(state) => mtime > state.mtime,
            }
        };
        if !stale {
            return Ok(());
        }

        // Parse the whole file before touching the cache.
        let forms = self.parse_file()?;
        let mut guard = self
            .cache
            .write()
            .map_err(|_| Error::Internal("mapping cache lock poisoned".to_string()))?;
        *guard = Some(CacheState { mtime, forms });
        Ok(())
    }

    fn parse_file(&self) -> Result<HashMap<String, Arc<FormMapping>>> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Config(format!("mapping file {}: {e}", self.path.display()))
        })?;
        let data: Value = serde_json::from_str(&text).map_err(|e| {
            Error::Config(format!("mapping file {}: {e}", self.path.display()))
        })?;
        let Value::Object(entries) = data else {
            return Err(Error::Config(
                "mapping file must contain an object at the top level".to_string(),
            ));
        };

        let mut forms = HashMap::new();
        for (name, raw) in &entries {
            let mapping = self.parse_form(name, raw)?;
            forms.insert(name.clone(), Arc::new(mapping));
        }
        Ok(forms)
    }

    fn parse_form(&self, name: &str, raw: &Value) -> Result<FormMapping> {
        let Value::Object(obj) = raw else {
            return Err(Error::Config(format!(
                "form '{name}': entry must be an object"
            )));
        };

        // Legacy shape: a flat string map of deal fields.
        if !obj.is_empty() && obj.values().all(Value::is_string) {
            let deal_fields = string_pairs(name, "deal_fields", raw)?;
            let mut mapping = FormMapping {
                name: name.to_string(),
                kind: FormKind::Primary,
                deal_fields,
                contact_fields: Vec::new(),
                participation_field: None,
                file_fields: HashMap::new(),
                search: SearchKeys::default(),
            };
            mapping.search = self.build_search_keys(&mapping, None)?;
            return Ok(mapping);
        }

        let deal_fields = match obj.get("deal_fields").or_else(|| obj.get("fields")) {
            Some(v) => string_pairs(name, "deal_fields", v)?,
            None => Vec::new(),
        };
        let contact_fields = match obj.get("contact_fields").or_else(|| obj.get("contact")) {
            Some(v) => string_pairs(name, "contact_fields", v)?,
            None => Vec::new(),
        };
        let kind = match obj.get("kind") {
            None => FormKind::Primary,
            Some(Value::String(s)) if s == "primary" => FormKind::Primary,
            Some(Value::String(s)) if s == "secondary" => FormKind::Secondary,
            Some(other) => {
                return Err(Error::Config(format!(
                    "form '{name}': kind must be \"primary\" or \"secondary\", got {other}"
                )))
            }
        };
        let participation_field = match obj.get("participation_field") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(Error::Config(format!(
                    "form '{name}': participation_field must be a string, got {other}"
                )))
            }
        };
        let file_fields = match obj.get("file_fields").or_else(|| obj.get("attachments")) {
            Some(v) => string_pairs(name, "file_fields", v)?.into_iter().collect(),
            None => HashMap::new(),
        };

        let mut mapping = FormMapping {
            name: name.to_string(),
            kind,
            deal_fields,
            contact_fields,
            participation_field,
            file_fields,
            search: SearchKeys::default(),
        };
        mapping.search = self.build_search_keys(&mapping, obj.get("search"))?;
        Ok(mapping)
    }

    /// Explicit `search` keys win; otherwise fall back to a reverse lookup of
    /// the relevant Bitrix field in the form's own mappings.
    fn build_search_keys(
        &self,
        mapping: &FormMapping,
        config: Option<&Value>,
    ) -> Result<SearchKeys> {
        let name = &mapping.name;
        let get = |key: &str| -> Result<Vec<String>> {
            match config.and_then(|c| c.get(key)) {
                None | Some(Value::Null) => Ok(Vec::new()),
                Some(v) => string_or_list(name, key, v),
            }
        };

        let mut inn = get("inn")?;
        if inn.is_empty() {
            inn = mapping.deal_keys_for(&self.inn_field);
        }
        let mut company = get("company")?;
        if company.is_empty() {
            company = mapping.deal_keys_for(&self.title_field);
        }
        let mut phone = get("phone")?;
        if phone.is_empty() {
            phone = mapping.contact_keys_for("PHONE");
        }
        let mut email = get("email")?;
        if email.is_empty() {
            email = mapping.contact_keys_for("EMAIL");
        }
        Ok(SearchKeys {
            inn,
            company,
            phone,
            email,
        })
    }
}

fn string_pairs(form: &str, section: &str, value: &Value) -> Result<Vec<(String, String)>> {
    let Value::Object(obj) = value else {
        return Err(Error::Config(format!(
            "form '{form}': {section} must be an object of strings"
        )));
    };
    let mut pairs = Vec::with_capacity(obj.len());
    for (k, v) in obj {
        let Value::String(s) = v else {
            return Err(Error::Config(format!(
                "form '{form}': {section}.{k} must be a string"
            )));
        };
        pairs.push((k.clone(), s.clone()));
    }
    Ok(pairs)
}

fn string_or_list(form: &str, key: &str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let Value::String(s) = item else {
                    return Err(Error::Config(format!(
                        "form '{form}': search.{key} entries must be strings"
                    )));
                };
                out.push(s.clone());
            }
            Ok(out)
        }
        other => Err(Error::Config(format!(
            "form '{form}': search.{key} must be a string or list of strings, got {other}"
        ))),
    }
}
