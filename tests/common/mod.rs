#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use zip::write::SimpleFileOptions;

use sheet_harness::config::Config;
use sheet_harness::error::{Error, Result};
use sheet_harness::ingest::IncomingFile;
use sheet_harness::oracle::{CodeOracle, Intent};
use sheet_harness::sandbox::ResultShape;
use sheet_harness::session::SessionManager;

fn cell_xml(value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else if value.parse::<f64>().is_ok() {
        format!("<c><v>{}</v></c>", value)
    } else {
        format!("<c t=\"inlineStr\"><is><t>{}</t></is></c>", value)
    }
}

/// Build a minimal `.xlsx` with the given sheets. Each sheet is a grid of
/// cell texts; numeric-looking texts become numbers.
pub fn xlsx(sheets: &[(&str, &[&[&str]])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default();

    let mut workbook = String::from(
        r#"<workbook xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>"#,
    );
    let mut rels = String::from("<Relationships>");
    for (i, (name, _)) in sheets.iter().enumerate() {
        let n = i + 1;
        workbook.push_str(&format!(
            r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
            name, n, n
        ));
        rels.push_str(&format!(
            r#"<Relationship Id="rId{}" Type="worksheet" Target="worksheets/sheet{}.xml"/>"#,
            n, n
        ));
    }
    workbook.push_str("</sheets></workbook>");
    rels.push_str("</Relationships>");

    writer.start_file("xl/workbook.xml", opts).unwrap();
    writer.write_all(workbook.as_bytes()).unwrap();
    writer.start_file("xl/_rels/workbook.xml.rels", opts).unwrap();
    writer.write_all(rels.as_bytes()).unwrap();

    for (i, (_, grid)) in sheets.iter().enumerate() {
        let mut body = String::from("<worksheet><sheetData>");
        for row in grid.iter() {
            body.push_str("<row>");
            for value in row.iter() {
                body.push_str(&cell_xml(value));
            }
            body.push_str("</row>");
        }
        body.push_str("</sheetData></worksheet>");
        writer
            .start_file(format!("xl/worksheets/sheet{}.xml", i + 1), opts)
            .unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }

    writer.finish().unwrap().into_inner()
}

/// An `.xlsx` holding one worksheet part with the given XML, verbatim.
pub fn xlsx_from_sheet_xml(sheet: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file("xl/worksheets/sheet1.xml", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(sheet.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

pub fn file(name: &str, bytes: Vec<u8>) -> IncomingFile {
    IncomingFile {
        filename: name.to_string(),
        bytes,
    }
}

/// `sales.xlsx` with a `Summary` sheet of regional revenue.
pub fn sales_workbook() -> IncomingFile {
    let summary: &[&[&str]] = &[
        &["region", "revenue"],
        &["north", "120"],
        &["south", "80.5"],
        &["north", "30"],
    ];
    file("sales.xlsx", xlsx(&[("Summary", summary)]))
}

/// `branch.xlsx` with its own `Summary` sheet.
pub fn branch_workbook() -> IncomingFile {
    let summary: &[&[&str]] = &[&["branch", "staff"], &["east", "4"], &["west", "7"]];
    file("branch.xlsx", xlsx(&[("Summary", summary)]))
}

pub async fn manager(dir: &tempfile::TempDir) -> Arc<SessionManager> {
    Arc::new(SessionManager::open(Config::rooted_at(dir.path())).await.unwrap())
}

/// Oracle that replays fixed answers and counts how often it was asked.
pub struct ScriptedOracle {
    pub intent: Intent,
    pub analysis_code: String,
    pub chart_code: String,
    pub calls: AtomicUsize,
    pub last_schemas: Mutex<Option<Value>>,
}

impl ScriptedOracle {
    pub fn new(intent: Intent, analysis_code: &str, chart_code: &str) -> Arc<Self> {
        Arc::new(Self {
            intent,
            analysis_code: analysis_code.to_string(),
            chart_code: chart_code.to_string(),
            calls: AtomicUsize::new(0),
            last_schemas: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn called(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CodeOracle for ScriptedOracle {
    async fn classify(&self, _message: &str, schemas: &Value) -> Result<Intent> {
        self.called();
        *self.last_schemas.lock().unwrap() = Some(schemas.clone());
        Ok(self.intent)
    }

    async fn generate_analysis_code(&self, _question: &str, _schemas: &Value) -> Result<String> {
        self.called();
        if self.analysis_code.is_empty() {
            return Err(Error::CodeGeneration("quota exceeded".into()));
        }
        Ok(self.analysis_code.clone())
    }

    async fn generate_chart_code(&self, _request: &str, _schemas: &Value) -> Result<String> {
        self.called();
        Ok(self.chart_code.clone())
    }

    async fn summarize_result(&self, _question: &str, result: &ResultShape) -> Result<String> {
        self.called();
        Ok(format!("The answer is {}", result.preview(200)))
    }

    async fn respond(&self, intent: Intent, _message: &str) -> Result<String> {
        self.called();
        Ok(format!("({}) Hello!", intent.label()))
    }
}
