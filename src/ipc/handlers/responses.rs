use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::{default_doc_id, ResponseRow, ResponseStore, SqliteStore};
use serde_json::json;

fn response_value_as_text(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn handle_responses_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let roll = match req.params.get("roll").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing roll", None),
    };
    let test_id = match req.params.get("testId").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing testId", None),
    };
    let doc_id = req
        .params
        .get("docId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| default_doc_id(&roll, &test_id));

    let Some(raw_responses) = req.params.get("responses").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "responses must be an array", None);
    };

    let mut responses: Vec<ResponseRow> = Vec::with_capacity(raw_responses.len());
    for raw in raw_responses {
        let Some(question_id) = raw.get("questionId").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                "each response needs a questionId",
                Some(json!({ "row": raw })),
            );
        };
        let Some(value) = raw.get("response").and_then(response_value_as_text) else {
            return err(
                &req.id,
                "bad_params",
                "each response needs a string or numeric response value",
                Some(json!({ "questionId": question_id })),
            );
        };
        responses.push(ResponseRow {
            question_id: question_id.to_string(),
            response: value,
        });
    }

    let store = SqliteStore::new(conn);
    match store.document_exists(&doc_id) {
        Ok(true) => {
            // Responses are immutable once submitted.
            return err(
                &req.id,
                "doc_exists",
                "response document already imported",
                Some(json!({ "docId": doc_id })),
            );
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    match store.insert_document(&doc_id, &roll, &test_id, &responses) {
        Ok(()) => ok(
            &req.id,
            json!({ "docId": doc_id, "imported": responses.len() }),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let store = SqliteStore::new(conn);
    match store.list_students() {
        Ok(rows) => {
            let students: Vec<serde_json::Value> = rows
                .iter()
                .map(|(roll, evaluated)| json!({ "roll": roll, "evaluated": evaluated }))
                .collect();
            ok(&req.id, json!({ "students": students }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_documents(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(roll) = req.params.get("roll").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing roll", None);
    };

    let store = SqliteStore::new(conn);
    let doc_ids = match store.docs_for_student(roll) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut docs: Vec<serde_json::Value> = Vec::with_capacity(doc_ids.len());
    for doc_id in doc_ids {
        let doc = match store.get_document(&doc_id) {
            Ok(Some(d)) => d,
            Ok(None) => continue,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        // A document counts as text-marked once any mark is recorded or a
        // non-zero text total was saved.
        let text_done = doc
            .evaluation
            .as_ref()
            .map(|e| !e.text_marks.is_empty() || e.text_total.map(|t| t != 0).unwrap_or(false))
            .unwrap_or(false);
        docs.push(json!({
            "docId": doc.doc_id,
            "testId": doc.test_id,
            "responseCount": doc.responses.len(),
            "textDone": text_done,
            "finalTotal": doc.evaluation.as_ref().and_then(|e| e.final_total),
            "grandTotal": doc.evaluation.as_ref().and_then(|e| e.grand_total),
        }));
    }

    ok(&req.id, json!({ "roll": roll, "documents": docs }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "responses.import" => Some(handle_responses_import(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.documents" => Some(handle_students_documents(state, req)),
        _ => None,
    }
}
