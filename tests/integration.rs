use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn sheet_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sheet"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("staff.csv"),
        "name,team,age\nann,ops,31\nbo,dev,45\ncy,ops,28\n",
    )
    .unwrap();
    fs::write(files_dir.join("notes.pdf"), "%PDF-1.4").unwrap();
    fs::write(
        files_dir.join("total.lua"),
        "result = tables.staff_Sheet1:sum('age')\n",
    )
    .unwrap();
    fs::write(
        files_dir.join("teams.lua"),
        "result = tables.staff_Sheet1:aggregate('team', { age = 'max' })\n",
    )
    .unwrap();
    fs::write(
        files_dir.join("pie.lua"),
        "local t = tables.staff_Sheet1:aggregate('team', { name = 'count' })\n\
         fig = chart.figure(chart.pie(t:values('team'), t:values('name')))\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/sheet.sqlite"

[storage]
upload_dir = "{root}/uploads"

[sandbox]
timeout_secs = 5

[server]
bind = "127.0.0.1:8000"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("sheet.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_sheet(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = sheet_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run sheet binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn root_of(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().to_path_buf()
}

fn file_arg(config_path: &Path, name: &str) -> String {
    root_of(config_path)
        .join("files")
        .join(name)
        .to_string_lossy()
        .to_string()
}

/// Upload `staff.csv` and return the new session id.
fn upload_staff(config_path: &Path) -> String {
    let staff = file_arg(config_path, "staff.csv");
    let (stdout, stderr, success) = run_sheet(config_path, &["upload", &staff]);
    assert!(success, "upload failed: {}", stderr);
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("Session: "))
        .expect("upload prints the session id")
        .trim()
        .to_string()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_sheet(&config, &["init"]);
    assert!(success);
    assert!(stdout.contains("initialized"));
    assert!(root_of(&config).join("data/sheet.sqlite").exists());
    assert!(root_of(&config).join("uploads").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    assert!(run_sheet(&config, &["init"]).2);
    let (_, stderr, success) = run_sheet(&config, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_session_new_and_show() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_sheet(&config, &["session", "new"]);
    assert!(success);
    let id = stdout.trim().to_string();
    assert_eq!(id.len(), 36);

    let (stdout, _, success) = run_sheet(&config, &["session", "show", &id]);
    assert!(success);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("History: 0 turn(s)"));
}

#[test]
fn test_show_unknown_session_fails() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_sheet(
        &config,
        &["session", "show", "00000000-0000-4000-8000-000000000000"],
    );
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr: {}", stderr);
}

#[test]
fn test_upload_reports_each_file() {
    let (_tmp, config) = setup_test_env();
    let staff = file_arg(&config, "staff.csv");
    let notes = file_arg(&config, "notes.pdf");
    let (stdout, stderr, success) = run_sheet(&config, &["upload", &staff, &notes]);
    assert!(success, "stderr: {}", stderr);
    assert!(stdout.contains("ok    staff.csv → staff_Sheet1"));
    assert!(stdout.contains("fail  notes.pdf (unsupported_file_format)"));
}

#[test]
fn test_upload_all_failed_exits_nonzero() {
    let (_tmp, config) = setup_test_env();
    let notes = file_arg(&config, "notes.pdf");
    let (_, _, success) = run_sheet(&config, &["upload", &notes]);
    assert!(!success);
}

#[test]
fn test_upload_into_existing_session_suffixes_keys() {
    let (_tmp, config) = setup_test_env();
    let id = upload_staff(&config);
    let staff = file_arg(&config, "staff.csv");
    let (stdout, _, success) = run_sheet(&config, &["upload", &staff, "--session", &id]);
    assert!(success);
    assert!(stdout.contains(&format!("Session: {}", id)));
    assert!(stdout.contains("staff_Sheet1_2"));

    let (stdout, _, _) = run_sheet(&config, &["session", "list"]);
    assert!(stdout.contains(&format!("{}  files=2  turns=0", id)));
}

#[test]
fn test_run_script_scalar() {
    let (_tmp, config) = setup_test_env();
    let id = upload_staff(&config);
    let script = file_arg(&config, "total.lua");
    let (stdout, stderr, success) = run_sheet(&config, &["run", &script, "--session", &id]);
    assert!(success, "stderr: {}", stderr);

    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["kind"], "scalar");
    assert_eq!(value["value"], 104);
}

#[test]
fn test_run_script_tabular() {
    let (_tmp, config) = setup_test_env();
    let id = upload_staff(&config);
    let script = file_arg(&config, "teams.lua");
    let (stdout, _, success) = run_sheet(&config, &["run", &script, "--session", &id]);
    assert!(success);

    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["kind"], "tabular");
    assert_eq!(value["columns"], serde_json::json!(["team", "age"]));
    assert_eq!(
        value["rows"],
        serde_json::json!([{"team": "ops", "age": 31}, {"team": "dev", "age": 45}])
    );
}

#[test]
fn test_run_script_chart() {
    let (_tmp, config) = setup_test_env();
    let id = upload_staff(&config);
    let script = file_arg(&config, "pie.lua");
    let (stdout, _, success) = run_sheet(&config, &["run", &script, "--session", &id, "--chart"]);
    assert!(success);

    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["chart_type"], "pie");
    assert_eq!(value["figure"]["data"][0]["values"], serde_json::json!([2, 1]));
}

#[test]
fn test_run_script_leaves_history_untouched() {
    let (_tmp, config) = setup_test_env();
    let id = upload_staff(&config);
    let script = file_arg(&config, "total.lua");
    assert!(run_sheet(&config, &["run", &script, "--session", &id]).2);
    let (stdout, _, _) = run_sheet(&config, &["session", "show", &id]);
    assert!(stdout.contains("History: 0 turn(s)"));
}

#[test]
fn test_ask_without_data_fails() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, _) = run_sheet(&config, &["session", "new"]);
    let id = stdout.trim().to_string();
    let (_, stderr, success) = run_sheet(&config, &["ask", "how many rows?", "--session", &id]);
    assert!(!success);
    assert!(stderr.contains("upload"), "stderr: {}", stderr);
}

#[test]
fn test_ask_with_disabled_oracle_fails() {
    let (_tmp, config) = setup_test_env();
    let id = upload_staff(&config);
    let (_, stderr, success) = run_sheet(&config, &["ask", "oldest person?", "--session", &id]);
    assert!(!success);
    assert!(stderr.contains("code generation failed"), "stderr: {}", stderr);

    let (stdout, _, _) = run_sheet(&config, &["session", "show", &id]);
    assert!(stdout.contains("History: 0 turn(s)"));
}

#[test]
fn test_purge() {
    let (_tmp, config) = setup_test_env();
    let id = upload_staff(&config);
    let session_dir = root_of(&config).join("uploads").join(&id);
    assert!(session_dir.is_dir());

    let (stdout, _, success) = run_sheet(&config, &["purge"]);
    assert!(success);
    assert!(stdout.contains("Purged 0 session(s)"));

    std::thread::sleep(std::time::Duration::from_millis(20));
    let (stdout, _, success) = run_sheet(&config, &["purge", "--older-than-hours", "0"]);
    assert!(success);
    assert!(stdout.contains("Purged 1 session(s)"));
    assert!(stdout.contains(&id));
    assert!(!session_dir.exists());
}

#[test]
fn test_invalid_config_fails() {
    let (_tmp, config) = setup_test_env();
    fs::write(&config, "[db]\npath = \"x.sqlite\"\n\n[oracle]\nprovider = \"mystery\"\n").unwrap();
    let (_, stderr, success) = run_sheet(&config, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Unknown oracle provider"));
}
