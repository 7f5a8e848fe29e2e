mod common;

use serde_json::json;
use std::sync::Arc;

use sheet_harness::error::Error;
use sheet_harness::ingest::ingest_files;
use sheet_harness::oracle::{DisabledOracle, Intent};
use sheet_harness::pipeline::Assistant;

use common::{manager, sales_workbook, ScriptedOracle};

const TOTAL_BY_REGION: &str = r#"
local df = tables.sales_Summary
result = df:aggregate("region", { revenue = "sum" })
"#;

const REVENUE_CHART: &str = r#"
local df = tables.sales_Summary:aggregate("region", { revenue = "sum" })
fig = chart.figure(chart.bar(df:values("region"), df:values("revenue")), { title = "Revenue" })
"#;

#[tokio::test]
async fn no_data_fails_before_the_oracle_is_called() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(&dir).await;
    let oracle = ScriptedOracle::new(Intent::DataAnalysis, TOTAL_BY_REGION, REVENUE_CHART);
    let assistant = Assistant::new(mgr.clone(), oracle.clone());

    let fresh = mgr.create_session().await.unwrap();
    let err = assistant
        .ask(Some(fresh.session_id()), "total revenue?")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoDataUploaded));

    let err = assistant.visualize(None, "revenue chart").await.unwrap_err();
    assert!(matches!(err, Error::NoDataUploaded));

    assert_eq!(oracle.calls(), 0);
    assert!(mgr.history(fresh.session_id()).await.unwrap().is_empty());
}

#[tokio::test]
async fn schema_only_sessions_count_as_no_data() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(&dir).await;
    let report = ingest_files(&mgr, None, vec![sales_workbook()]).await.unwrap();
    let record = mgr.get_session(&report.session_id).await.unwrap().record;
    std::fs::remove_file(&record.uploaded_files[0].file_path).unwrap();
    mgr.cache().invalidate_all().await;

    let oracle = ScriptedOracle::new(Intent::DataAnalysis, TOTAL_BY_REGION, REVENUE_CHART);
    let assistant = Assistant::new(mgr.clone(), oracle.clone());
    let err = assistant
        .ask(Some(&report.session_id), "total?")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoDataUploaded));
    assert_eq!(oracle.calls(), 0);
}

#[tokio::test]
async fn data_question_runs_the_fragment_and_records_a_turn() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(&dir).await;
    let report = ingest_files(&mgr, None, vec![sales_workbook()]).await.unwrap();
    let oracle = ScriptedOracle::new(Intent::DataAnalysis, TOTAL_BY_REGION, REVENUE_CHART);
    let assistant = Assistant::new(mgr.clone(), oracle.clone());

    let answer = assistant
        .ask(Some(&report.session_id), "Revenue by region?")
        .await
        .unwrap();
    assert_eq!(answer.session_id, report.session_id);
    assert_eq!(answer.intent, Intent::DataAnalysis);
    assert_eq!(
        answer.data,
        Some(json!([
            {"region": "north", "revenue": 150},
            {"region": "south", "revenue": 80.5}
        ]))
    );
    assert!(answer.answer.starts_with("The answer is"));

    let schemas = oracle.last_schemas.lock().unwrap().clone().unwrap();
    assert_eq!(schemas["sales_Summary"]["has_data"], json!(true));

    let history = mgr.history(&report.session_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].question.as_deref(), Some("Revenue by region?"));
    assert_eq!(history[0].code.as_deref(), Some(TOTAL_BY_REGION));
}

#[tokio::test]
async fn failing_fragment_leaves_no_turn() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(&dir).await;
    let report = ingest_files(&mgr, None, vec![sales_workbook()]).await.unwrap();

    for code in [
        "local x = tables.sales_Summary:sum('revenue')",
        "result = tables.nope.rows",
        "result = tables.sales_Summary:aggregate('region', { revenue = 'mode' })",
    ] {
        let oracle = ScriptedOracle::new(Intent::DataAnalysis, code, "");
        let assistant = Assistant::new(mgr.clone(), oracle);
        let err = assistant
            .ask(Some(&report.session_id), "anything")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution_failed", "fragment: {}", code);
    }
    assert!(mgr.history(&report.session_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn oracle_failure_leaves_no_turn() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(&dir).await;
    let report = ingest_files(&mgr, None, vec![sales_workbook()]).await.unwrap();

    let oracle = ScriptedOracle::new(Intent::DataAnalysis, "", "");
    let assistant = Assistant::new(mgr.clone(), oracle);
    let err = assistant
        .ask(Some(&report.session_id), "total?")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "code_generation_failed");

    let assistant = Assistant::new(mgr.clone(), Arc::new(DisabledOracle));
    let err = assistant
        .visualize(Some(&report.session_id), "chart")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "code_generation_failed");

    assert!(mgr.history(&report.session_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn greetings_skip_the_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(&dir).await;
    let report = ingest_files(&mgr, None, vec![sales_workbook()]).await.unwrap();
    let oracle = ScriptedOracle::new(Intent::Greeting, "error('must not run')", "");
    let assistant = Assistant::new(mgr.clone(), oracle);

    let answer = assistant.ask(Some(&report.session_id), "hi!").await.unwrap();
    assert_eq!(answer.answer, "(greeting) Hello!");
    assert!(answer.data.is_none());

    let history = mgr.history(&report.session_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].code.is_none());
}

#[tokio::test]
async fn visualize_returns_a_figure_and_records_a_turn() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(&dir).await;
    let report = ingest_files(&mgr, None, vec![sales_workbook()]).await.unwrap();
    let oracle = ScriptedOracle::new(Intent::ChartRequest, "", REVENUE_CHART);
    let assistant = Assistant::new(mgr.clone(), oracle);

    let chart = assistant
        .visualize(Some(&report.session_id), "revenue per region")
        .await
        .unwrap();
    assert_eq!(chart.chart_type, "bar");
    assert_eq!(chart.description, "Visualization showing: revenue per region");
    assert_eq!(chart.chart_data["data"][0]["x"], json!(["north", "south"]));
    assert_eq!(chart.chart_data["layout"]["title"]["text"], json!("Revenue"));

    let history = mgr.history(&report.session_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].answer.as_deref(), Some(chart.description.as_str()));

    // A chart intent on the question path renders the same figure.
    let answer = assistant
        .ask(Some(&report.session_id), "plot revenue")
        .await
        .unwrap();
    assert_eq!(answer.intent, Intent::ChartRequest);
    assert_eq!(answer.data.unwrap()["data"][0]["type"], json!("bar"));
}

#[tokio::test]
async fn fragments_see_a_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(&dir).await;
    let report = ingest_files(&mgr, None, vec![sales_workbook()]).await.unwrap();

    let mutate = "tables.sales_Summary.rows[1].revenue = 1000000 result = tables.sales_Summary:sum('revenue')";
    let oracle = ScriptedOracle::new(Intent::DataAnalysis, mutate, "");
    let assistant = Assistant::new(mgr.clone(), oracle);
    let first = assistant.ask(Some(&report.session_id), "q").await.unwrap();
    let second = assistant.ask(Some(&report.session_id), "q").await.unwrap();
    assert_eq!(first.data, second.data);
    assert_eq!(first.data, Some(json!(1000110.5)));
}
