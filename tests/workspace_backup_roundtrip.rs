use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_evaldeskd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn evaldeskd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn backup_bundle_restores_an_equivalent_workspace() {
    let workspace = temp_dir("evaldesk-backup-src");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "bank.import",
        json!({ "testId": "objective", "title": "Objective", "questions": [
            { "QuestionID": "Q1", "Type": "mcq", "Question": "q", "Answer": "A" },
            { "QuestionID": "Q2", "Type": "mcq", "Question": "q", "Answer": "B" }
        ]}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "responses.import",
        json!({ "roll": "R1", "testId": "objective", "responses": [
            { "questionId": "Q1", "response": "A" },
            { "questionId": "Q2", "response": "B" }
        ]}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "evaluation.save",
        json!({ "docId": "R1_objective", "textMarks": {} }),
    );

    let bundle_path = temp_dir("evaldesk-backup-out").join("workspace.evaldesk.zip");
    let export = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "backup.export",
        json!({ "outPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        export.get("bundleFormat").and_then(|v| v.as_str()),
        Some("evaldesk-workspace-v1")
    );
    let exported_sha = export
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .expect("export digest")
        .to_string();
    assert_eq!(exported_sha.len(), 64);

    // Restore into a fresh workspace and verify the data survived.
    let restored = temp_dir("evaldesk-backup-dst");
    let import = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "backup.import",
        json!({
            "inPath": bundle_path.to_string_lossy(),
            "workspacePath": restored.to_string_lossy()
        }),
    );
    assert_eq!(
        import.get("dbSha256").and_then(|v| v.as_str()),
        Some(exported_sha.as_str())
    );

    let docs = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.documents",
        json!({ "roll": "R1" }),
    );
    let documents = docs
        .get("documents")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("documents array");
    assert_eq!(documents.len(), 1);
    assert_eq!(
        documents[0].get("finalTotal").and_then(|v| v.as_i64()),
        Some(2)
    );
    assert_eq!(
        documents[0].get("grandTotal").and_then(|v| v.as_i64()),
        Some(2)
    );
}

#[test]
fn importing_a_non_bundle_file_fails_cleanly() {
    let workspace = temp_dir("evaldesk-backup-bad");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let bogus = workspace.join("not-a-bundle.zip");
    std::fs::write(&bogus, b"plain text, not a zip archive").expect("write bogus file");

    let value = request(
        &mut stdin,
        &mut reader,
        "2",
        "backup.import",
        json!({ "inPath": bogus.to_string_lossy() }),
    );
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value.pointer("/error/code").and_then(|v| v.as_str()),
        Some("backup_import_failed")
    );

    // The sidecar reopened nothing destructive; the workspace still answers.
    let _ = request_ok(&mut stdin, &mut reader, "3", "students.list", json!({}));
}
