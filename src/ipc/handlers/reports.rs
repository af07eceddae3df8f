use crate::bank;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::{ResponseStore, SqliteStore};
use serde_json::json;
use std::collections::HashMap;

/// One structured row per response document, component scores reported only
/// for components the test's bank actually contains. Rendering (CSV/Excel)
/// belongs to the presentation layer.
fn handle_marks_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let tests = match bank::list_tests(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let tests_by_id: HashMap<&str, &bank::TestSummary> =
        tests.iter().map(|t| (t.id.as_str(), t)).collect();

    let store = SqliteStore::new(conn);
    let doc_ids = match store.list_all_doc_ids() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut rows: Vec<serde_json::Value> = Vec::with_capacity(doc_ids.len());
    for doc_id in doc_ids {
        let doc = match store.get_document(&doc_id) {
            Ok(Some(d)) => d,
            Ok(None) => continue,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let summary = tests_by_id.get(doc.test_id.as_str());
        let eval = doc.evaluation.as_ref();

        let component = |applies: bool, value: Option<i64>| -> serde_json::Value {
            if applies {
                value.map(|v| json!(v)).unwrap_or(serde_json::Value::Null)
            } else {
                serde_json::Value::Null
            }
        };

        rows.push(json!({
            "docId": doc.doc_id,
            "roll": doc.roll,
            "testId": doc.test_id,
            "title": summary.map(|s| s.title.clone()),
            "mcqScore": component(
                summary.map(|s| s.has_mcq).unwrap_or(false),
                eval.and_then(|e| e.mcq_total),
            ),
            "likertScore": component(
                summary.map(|s| s.has_likert).unwrap_or(false),
                eval.and_then(|e| e.likert_total),
            ),
            "textScore": component(
                summary.map(|s| s.has_text).unwrap_or(false),
                eval.and_then(|e| e.text_total),
            ),
            "finalTotal": eval.and_then(|e| e.final_total),
            "grandTotal": eval.and_then(|e| e.grand_total),
        }));
    }

    ok(&req.id, json!({ "rows": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.marksExport" => Some(handle_marks_export(state, req)),
        _ => None,
    }
}
