mod common;

use serde_json::{json, Value};
use std::sync::Arc;

use sheet_harness::oracle::{DisabledOracle, Intent};
use sheet_harness::pipeline::Assistant;
use sheet_harness::server::router;

use common::{manager, sales_workbook, ScriptedOracle};

const BOUNDARY: &str = "sheet-harness-test-boundary";

/// Serve the API on an ephemeral port and return its base URL.
async fn spawn_api(assistant: Assistant) -> String {
    let app = router(Arc::new(assistant));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Hand-built `multipart/form-data` body: `(field, filename, bytes)` parts,
/// where a `None` filename makes a text part.
fn multipart(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, filename, bytes) in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match filename {
            Some(name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    field, name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", field).as_bytes(),
            ),
        }
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn upload(
    client: &reqwest::Client,
    base: &str,
    parts: &[(&str, Option<&str>, &[u8])],
) -> reqwest::Response {
    client
        .post(format!("{}/api/upload", base))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(multipart(parts))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_and_banner() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_api(Assistant::new(manager(&dir).await, Arc::new(DisabledOracle))).await;

    let health: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let banner: Value = reqwest::get(format!("{}/", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(banner["endpoints"]["upload"], "/api/upload");
}

#[tokio::test]
async fn upload_then_inspect_session() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_api(Assistant::new(manager(&dir).await, Arc::new(DisabledOracle))).await;
    let client = reqwest::Client::new();

    let sales = sales_workbook();
    let resp = upload(
        &client,
        &base,
        &[
            ("file", Some("sales.xlsx"), sales.bytes.as_slice()),
            ("file", Some("notes.pdf"), &b"%PDF-1.4"[..]),
        ],
    )
    .await;
    assert_eq!(resp.status(), 200);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["files"][0]["tables"], json!(["sales_Summary"]));
    assert_eq!(report["errors"][0]["code"], "unsupported_file_format");
    let id = report["session_id"].as_str().unwrap().to_string();

    let detail: Value = client
        .get(format!("{}/api/session/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["session_id"], id.as_str());
    assert_eq!(detail["tables"], json!(["sales_Summary"]));
    assert_eq!(detail["files"][0]["filename"], "sales.xlsx");
    assert_eq!(detail["schema"]["sales_Summary"]["has_data"], true);
    assert_eq!(detail["history"], json!([]));
}

#[tokio::test]
async fn upload_into_a_named_session() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_api(Assistant::new(manager(&dir).await, Arc::new(DisabledOracle))).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/api/session", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["session_id"].as_str().unwrap().to_string();

    let sales = sales_workbook();
    let resp = upload(
        &client,
        &base,
        &[
            ("session_id", None, id.as_bytes()),
            ("files", Some("sales.xlsx"), sales.bytes.as_slice()),
        ],
    )
    .await;
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["session_id"], id.as_str());
}

#[tokio::test]
async fn upload_with_only_bad_files_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_api(Assistant::new(manager(&dir).await, Arc::new(DisabledOracle))).await;
    let client = reqwest::Client::new();

    let resp = upload(&client, &base, &[("file", Some("notes.pdf"), &b"%PDF-1.4"[..])]).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "upload_failed");
}

#[tokio::test]
async fn unknown_session_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_api(Assistant::new(manager(&dir).await, Arc::new(DisabledOracle))).await;

    let resp = reqwest::get(format!("{}/api/session/{}", base, uuid::Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "session_not_found");
}

#[tokio::test]
async fn query_without_data_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_api(Assistant::new(manager(&dir).await, Arc::new(DisabledOracle))).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/query", base))
        .json(&json!({ "question": "total revenue?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "no_data_uploaded");

    let resp = client
        .post(format!("{}/api/visualize", base))
        .json(&json!({ "request": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn query_and_visualize_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(&dir).await;
    let oracle = ScriptedOracle::new(
        Intent::DataAnalysis,
        "result = tables.sales_Summary:sum('revenue')",
        "fig = chart.figure(chart.line({1, 2, 3}, tables.sales_Summary:values('revenue')))",
    );
    let base = spawn_api(Assistant::new(mgr, oracle)).await;
    let client = reqwest::Client::new();

    let sales = sales_workbook();
    let report: Value = upload(&client, &base, &[("file", Some("sales.xlsx"), sales.bytes.as_slice())])
        .await
        .json()
        .await
        .unwrap();
    let id = report["session_id"].as_str().unwrap().to_string();

    let answer: Value = client
        .post(format!("{}/api/query", base))
        .json(&json!({ "session_id": id, "question": "Total revenue?" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(answer["intent"], "data_query");
    assert_eq!(answer["data"], json!(230.5));

    let chart: Value = client
        .post(format!("{}/api/visualize", base))
        .json(&json!({ "session_id": id, "request": "revenue trend" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(chart["chart_type"], "line");
    assert_eq!(chart["chart_data"]["data"][0]["y"], json!([120, 80.5, 30]));

    let detail: Value = reqwest::get(format!("{}/api/session/{}", base, id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let history = detail["history"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].get("code").is_none());
}

#[tokio::test]
async fn failed_fragment_hides_details() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(&dir).await;
    let oracle = ScriptedOracle::new(Intent::DataAnalysis, "error('secret internals')", "");
    let base = spawn_api(Assistant::new(mgr, oracle)).await;
    let client = reqwest::Client::new();

    let sales = sales_workbook();
    let report: Value = upload(&client, &base, &[("file", Some("sales.xlsx"), sales.bytes.as_slice())])
        .await
        .json()
        .await
        .unwrap();

    let resp = client
        .post(format!("{}/api/query", base))
        .json(&json!({ "session_id": report["session_id"], "question": "anything" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "execution_failed");
    assert!(!body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("secret internals"));
}
