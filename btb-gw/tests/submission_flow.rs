//! End-to-end submission flow against an in-process mock Bitrix24 server

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::routing::any;
use axum::{Json, Router};
use btb_common::config::Settings;
use btb_gw::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

/// Scripted Bitrix24 stand-in: records every call and serves canned
/// responses.
#[derive(Clone)]
struct MockBitrix {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    /// Rows served by crm.contact.list for a PHONE filter
    contacts_by_phone: Arc<Mutex<Vec<Value>>>,
    /// Rows served by crm.contact.list for an EMAIL filter
    contacts_by_email: Arc<Mutex<Vec<Value>>>,
    /// Rows served by crm.deal.list
    base_deal_rows: Arc<Mutex<Vec<Value>>>,
    deal_seq: Arc<AtomicU64>,
    folder_seq: Arc<AtomicU64>,
    file_seq: Arc<AtomicU64>,
    /// 1-based crm.deal.add call numbers that fail with an error envelope
    failing_deal_adds: Arc<Mutex<HashSet<usize>>>,
}

impl MockBitrix {
    fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            contacts_by_phone: Arc::new(Mutex::new(Vec::new())),
            contacts_by_email: Arc::new(Mutex::new(Vec::new())),
            base_deal_rows: Arc::new(Mutex::new(Vec::new())),
            deal_seq: Arc::new(AtomicU64::new(501)),
            folder_seq: Arc::new(AtomicU64::new(201)),
            file_seq: Arc::new(AtomicU64::new(1)),
            failing_deal_adds: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn calls_named(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, body)| body.clone())
            .collect()
    }

    fn disk_call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m.starts_with("disk."))
            .count()
    }
}

async fn mock_handler(
    State(mock): State<MockBitrix>,
    Path(method): Path<String>,
    request: Request,
) -> Json<Value> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("multipart/form-data"))
        .unwrap_or(false);
    let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    let body = if is_multipart {
        Value::String(format!("<multipart {} bytes>", bytes.len()))
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };

    let filter = body.get("filter").cloned().unwrap_or(Value::Null);
    let deal_add_number = {
        let mut calls = mock.calls.lock().unwrap();
        calls.push((method.clone(), body));
        calls.iter().filter(|(m, _)| m == "crm.deal.add").count()
    };

    let response = match method.as_str() {
        "crm.contact.list" => {
            let rows = if filter.get("PHONE").is_some() {
                mock.contacts_by_phone.lock().unwrap().clone()
            } else if filter.get("EMAIL").is_some() {
                mock.contacts_by_email.lock().unwrap().clone()
            } else {
                Vec::new()
            };
            json!({"result": rows})
        }
        "crm.contact.add" => json!({"result": 777}),
        "crm.deal.list" => json!({"result": *mock.base_deal_rows.lock().unwrap()}),
        "crm.deal.add" => {
            if mock.failing_deal_adds.lock().unwrap().contains(&deal_add_number) {
                json!({"error": "QUERY_LIMIT_EXCEEDED", "error_description": "Too many requests"})
            } else {
                json!({"result": mock.deal_seq.fetch_add(1, Ordering::SeqCst)})
            }
        }
        "crm.deal.update" => json!({"result": true}),
        "crm.deal.fields" => json!({"result": {"TITLE": {"type": "string"}}}),
        "disk.storage.getforuser" => json!({"result": {"rootObjectId": "100"}}),
        "disk.folder.getchildren" => json!({"result": []}),
        "disk.folder.add" => {
            json!({"result": {"ID": mock.folder_seq.fetch_add(1, Ordering::SeqCst)}})
        }
        "disk.folder.uploadfile" => {
            json!({"result": {"ID": format!("f{}", mock.file_seq.fetch_add(1, Ordering::SeqCst))}})
        }
        other => json!({"error": "UNKNOWN_METHOD", "error_description": other}),
    };
    Json(response)
}

/// Bind the mock on an ephemeral port and return its base URL
async fn start_mock(mock: MockBitrix) -> String {
    let router = Router::new()
        .route("/*method", any(mock_handler))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

const MAPPING: &str = r#"{
    "tilda_form_main": {
        "kind": "primary",
        "deal_fields": {"company": "TITLE", "comment": "COMMENTS"},
        "contact_fields": {"name": "NAME", "phone": "PHONE", "email": "EMAIL"},
        "participation_field": "format",
        "file_fields": {
            "Показ": "showfile",
            "Маркет": "marketfile",
            "linesheet": "linesheet_file"
        }
    },
    "tilda_form_stock": {
        "kind": "secondary",
        "deal_fields": {"company": "TITLE"},
        "contact_fields": {"phone": "PHONE"}
    }
}"#;

async fn app_for(dir: &tempfile::TempDir, bitrix_url: &str) -> (AppState, Router) {
    let mut settings = Settings::default();
    settings.bitrix_webhook_base_url = bitrix_url.to_string();
    settings.mapping_file = dir.path().join("mapping.json");
    settings.audit_log = dir.path().join("events.log");
    settings.fields_cache = dir.path().join("bitrix_fields.json");
    settings.upload_tmp_dir = dir.path().join("tmp_uploads");
    std::fs::write(&settings.mapping_file, MAPPING).unwrap();
    let state = AppState::new(settings).unwrap();
    let router = build_router(state.clone());
    (state, router)
}

fn form_request(uri: &str, body: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn push_text(body: &mut Vec<u8>, boundary: &str, name: &str, value: &str) {
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        )
        .as_bytes(),
    );
}

fn push_file(
    body: &mut Vec<u8>,
    boundary: &str,
    name: &str,
    file_name: &str,
    content_type: &str,
    data: &[u8],
) {
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn audit_lines(state: &AppState) -> Vec<Value> {
    let text = std::fs::read_to_string(&state.settings.audit_log).unwrap_or_default();
    text.lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn primary_submission_fans_out_one_deal_per_category() {
    let mock = MockBitrix::new();
    let base_url = start_mock(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (state, app) = app_for(&dir, &base_url).await;

    let boundary = "XQUMBOUNDARYX";
    let mut body = Vec::new();
    push_text(&mut body, boundary, "formname", "tilda_form_main");
    push_text(&mut body, boundary, "company", "Acme");
    push_text(&mut body, boundary, "phone", "89991234567");
    push_text(&mut body, boundary, "format", "Показ/Маркет");
    push_file(&mut body, boundary, "showfile", "look.jpg", "image/jpeg", b"jpegdata");
    push_file(&mut body, boundary, "marketfile", "price.pdf", "application/pdf", b"pdfdata");
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/webhook/tilda")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response_body = body_json(response).await;
    assert_eq!(response_body["deal_ids"], json!([501, 502]));

    // One deal per category, in extracted order, with the merged base record.
    let adds = mock.calls_named("crm.deal.add");
    assert_eq!(adds.len(), 2);
    assert_eq!(adds[0]["fields"]["CATEGORY_ID"], 8);
    assert_eq!(adds[0]["fields"]["STAGE_ID"], "C8:NEW");
    assert_eq!(adds[0]["fields"]["SOURCE_ID"], "tilda_form_main");
    assert_eq!(adds[0]["fields"]["TITLE"], "Acme - Показ");
    assert_eq!(adds[1]["fields"]["TITLE"], "Acme - Маркет");
    assert_eq!(adds[0]["fields"]["CONTACT_ID"], 777);

    // Each deal got exactly one file-list update carrying only its own
    // category's file ids.
    let updates = mock.calls_named("crm.deal.update");
    let file_updates: Vec<&Value> = updates
        .iter()
        .filter(|u| u["fields"].get("STAGE_ID").is_none())
        .collect();
    assert_eq!(file_updates.len(), 2);
    assert_eq!(file_updates[0]["id"], 501);
    assert_eq!(
        file_updates[0]["fields"]["UF_CRM_1764235976815"],
        json!(["f1"])
    );
    assert_eq!(file_updates[1]["id"], 502);
    assert_eq!(
        file_updates[1]["fields"]["UF_CRM_1764236005770"],
        json!(["f2"])
    );

    // Audit: one contact creation, two deal creations, no base transition.
    let lines = audit_lines(&state);
    let actions: Vec<&str> = lines
        .iter()
        .filter_map(|l| l["action"].as_str())
        .collect();
    assert_eq!(actions, vec!["contact_created", "deal_created", "deal_created"]);
    assert_eq!(lines[1]["category"], "Показ");
    assert_eq!(lines[2]["category"], "Маркет");

    // Staging directory is gone once the request is finished.
    let staged: Vec<_> = std::fs::read_dir(&state.settings.upload_tmp_dir)
        .map(|rd| rd.collect())
        .unwrap_or_default();
    assert!(staged.is_empty());
}

#[tokio::test]
async fn base_deal_transitions_once_and_links_resolved_contact() {
    let mock = MockBitrix::new();
    *mock.base_deal_rows.lock().unwrap() = vec![json!({"ID": "300", "STAGE_ID": "C6:NEW"})];
    *mock.contacts_by_phone.lock().unwrap() = vec![json!({"ID": "10", "COMPANY_ID": "20"})];
    let base_url = start_mock(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (state, app) = app_for(&dir, &base_url).await;

    let response = app
        .oneshot(form_request(
            "/webhook/tilda",
            "formname=tilda_form_main&company=Acme&phone=89991234567&format=%D0%9F%D0%BE%D0%BA%D0%B0%D0%B7,+%D0%9F%D0%BE%D0%BA%D0%B0%D0%B7,+%D0%9C%D0%B0%D1%80%D0%BA%D0%B5%D1%82",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response_body = body_json(response).await;
    // "Показ, Показ, Маркет" dedups into two categories
    assert_eq!(response_body["deal_ids"], json!([501, 502]));
    assert_eq!(response_body["base_deal_id"], 300);

    // Exactly one stage transition for the base deal.
    let updates = mock.calls_named("crm.deal.update");
    let transitions: Vec<&Value> = updates
        .iter()
        .filter(|u| u["fields"]["STAGE_ID"] == "C6:WON")
        .collect();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0]["id"], 300);

    // The resolved contact and its company land on both created deals.
    let adds = mock.calls_named("crm.deal.add");
    assert_eq!(adds.len(), 2);
    for add in &adds {
        assert_eq!(add["fields"]["CONTACT_ID"], 10);
        assert_eq!(add["fields"]["COMPANY_ID"], 20);
    }

    // No uploads: file placement must not touch the Disk API.
    assert_eq!(mock.disk_call_count(), 0);

    // Audit: base transition, then two deal creations; contact existed, so
    // no contact_created record.
    let actions: Vec<String> = audit_lines(&state)
        .iter()
        .filter_map(|l| l["action"].as_str().map(str::to_string))
        .collect();
    assert_eq!(actions, vec!["base_deal_won", "deal_created", "deal_created"]);
}

#[tokio::test]
async fn failed_category_aborts_remaining_without_rollback() {
    let mock = MockBitrix::new();
    mock.failing_deal_adds.lock().unwrap().insert(2);
    let base_url = start_mock(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (state, app) = app_for(&dir, &base_url).await;

    let response = app
        .oneshot(form_request(
            "/webhook/tilda",
            "formname=tilda_form_main&company=Acme&phone=89991234567&format=%D0%9F%D0%BE%D0%BA%D0%B0%D0%B7/%D0%9C%D0%B0%D1%80%D0%BA%D0%B5%D1%82/%D0%A8%D0%BE%D1%83%D1%80%D1%83%D0%BC",
        ))
        .await
        .unwrap();

    // Second category fails upstream: gateway error, first deal stays.
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let adds = mock.calls_named("crm.deal.add");
    assert_eq!(adds.len(), 2, "third category must not be attempted");

    let lines = audit_lines(&state);
    let actions: Vec<&str> = lines
        .iter()
        .filter_map(|l| l["action"].as_str())
        .collect();
    // The first category's record survives; the failure itself is audited.
    assert_eq!(actions, vec!["contact_created", "deal_created"]);
    assert_eq!(lines[1]["deal_id"], 501);
    let last = lines.last().unwrap();
    assert!(last["note"].as_str().unwrap().contains("Too many requests"));
}

#[tokio::test]
async fn zero_participation_categories_is_rejected() {
    let mock = MockBitrix::new();
    let base_url = start_mock(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (_state, app) = app_for(&dir, &base_url).await;

    let response = app
        .oneshot(form_request(
            "/webhook/tilda",
            "formname=tilda_form_main&company=Acme&format=nothing+known",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(mock.calls_named("crm.deal.add").is_empty());
}

#[tokio::test]
async fn phone_match_wins_over_differing_email_match() {
    let mock = MockBitrix::new();
    *mock.contacts_by_phone.lock().unwrap() = vec![json!({"ID": "10", "COMPANY_ID": null})];
    *mock.contacts_by_email.lock().unwrap() = vec![json!({"ID": "99", "COMPANY_ID": null})];
    let base_url = start_mock(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (_state, app) = app_for(&dir, &base_url).await;

    let response = app
        .oneshot(form_request(
            "/webhook/tilda",
            "formname=tilda_form_main&phone=89991234567&email=a%40b.c&format=%D0%9F%D0%BE%D0%BA%D0%B0%D0%B7",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let adds = mock.calls_named("crm.deal.add");
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0]["fields"]["CONTACT_ID"], 10);
}

#[tokio::test]
async fn secondary_form_creates_one_deal_without_fanout() {
    let mock = MockBitrix::new();
    let base_url = start_mock(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (state, app) = app_for(&dir, &base_url).await;

    let response = app
        .oneshot(form_request(
            "/webhook/tilda",
            "formname=tilda_form_stock&company=Acme&phone=89991234567",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let response_body = body_json(response).await;
    assert_eq!(response_body["deal_ids"], json!([501]));

    let adds = mock.calls_named("crm.deal.add");
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0]["fields"]["CATEGORY_ID"], 12);
    assert_eq!(adds[0]["fields"]["STAGE_ID"], "C12:NEW");
    assert_eq!(adds[0]["fields"]["TITLE"], "Acme - Сток");

    // No base-deal lookup for secondary forms.
    assert!(mock.calls_named("crm.deal.list").is_empty());

    let actions: Vec<String> = audit_lines(&state)
        .iter()
        .filter_map(|l| l["action"].as_str().map(str::to_string))
        .collect();
    assert_eq!(actions, vec!["contact_created", "deal_created"]);
}
