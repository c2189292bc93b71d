//! Tilda API client
//!
//! Read-only access to the form catalog, authenticated via the two static
//! API keys sent as query parameters.

use btb_common::config::Settings;
use btb_common::{Error, Result};
use serde_json::Value;
use std::time::Duration;

pub struct TildaClient {
    http: reqwest::Client,
    base_url: String,
    public_key: Option<String>,
    secret_key: Option<String>,
    project_id: Option<u64>,
}

impl TildaClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: settings.tilda_api_base_url.trim_end_matches('/').to_string(),
            public_key: settings.tilda_public_key.clone(),
            secret_key: settings.tilda_secret_key.clone(),
            project_id: settings.tilda_project_id,
        })
    }

    fn auth_params(&self) -> Result<Vec<(String, String)>> {
        match (&self.public_key, &self.secret_key) {
            (Some(public), Some(secret)) => Ok(vec![
                ("publickey".to_string(), public.clone()),
                ("secretkey".to_string(), secret.clone()),
            ]),
            _ => Err(Error::Config(
                "Tilda API keys are not configured".to_string(),
            )),
        }
    }

    async fn call(&self, path: &str, params: Vec<(String, String)>) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("{path}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Upstream(format!(
                "{path}: HTTP {}",
                status.as_u16()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("{path}: {e}")))
    }

    pub async fn list_forms(&self, project_id: Option<u64>) -> Result<Vec<Value>> {
        let mut params = self.auth_params()?;
        if let Some(project) = project_id.or(self.project_id) {
            params.push(("projectid".to_string(), project.to_string()));
        }
        let data = self.call("project/getformslist/", params).await?;
        let result = data
            .get("result")
            .cloned()
            .ok_or_else(|| Error::Upstream(format!("unexpected response from Tilda: {data}")))?;
        // Some API versions wrap the list in a "forms" object.
        let forms = match result {
            Value::Object(ref obj) if obj.contains_key("forms") => obj["forms"].clone(),
            other => other,
        };
        match forms {
            Value::Array(items) => Ok(items),
            _ => Err(Error::Upstream(
                "Tilda did not return a list of forms".to_string(),
            )),
        }
    }

    pub async fn get_form(&self, form_id: u64) -> Result<Value> {
        let mut params = self.auth_params()?;
        params.push(("formid".to_string(), form_id.to_string()));
        let data = self.call("form/getform/", params).await?;
        match data.get("result") {
            Some(result @ Value::Object(_)) => Ok(result.clone()),
            _ => Err(Error::Upstream(format!(
                "unexpected response from Tilda: {data}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_are_a_configuration_error() {
        let settings = Settings::default();
        let client = TildaClient::new(&settings).unwrap();
        assert!(matches!(client.auth_params(), Err(Error::Config(_))));
    }

    #[test]
    fn auth_params_carry_both_keys() {
        let mut settings = Settings::default();
        settings.tilda_public_key = Some("pub".into());
        settings.tilda_secret_key = Some("sec".into());
        let client = TildaClient::new(&settings).unwrap();
        let params = client.auth_params().unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].0, "publickey");
    }
}
