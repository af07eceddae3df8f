use crate::aggregate::{self, SaveOutcome};
use crate::bank::{self, QuestionType};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use crate::store::{ResponseStore, SqliteStore};
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

fn parse_text_marks(params: &serde_json::Value) -> Result<BTreeMap<String, i64>, String> {
    let Some(raw) = params.get("textMarks") else {
        return Ok(BTreeMap::new());
    };
    if raw.is_null() {
        return Ok(BTreeMap::new());
    }
    let Some(obj) = raw.as_object() else {
        return Err("textMarks must be an object of questionId -> integer".to_string());
    };
    let mut marks = BTreeMap::new();
    for (question_id, value) in obj {
        let Some(mark) = value.as_i64() else {
            return Err(format!("textMarks[{}] must be an integer", question_id));
        };
        marks.insert(question_id.clone(), mark);
    }
    Ok(marks)
}

fn outcome_json(outcome: &SaveOutcome) -> serde_json::Value {
    json!({
        "docId": outcome.doc_id,
        "roll": outcome.roll,
        "evaluation": serde_json::to_value(&outcome.evaluation).unwrap_or(serde_json::Value::Null),
        "grandTotal": outcome.grand_total,
        "siblingDocs": outcome.sibling_docs,
    })
}

fn handle_evaluation_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(doc_id) = req.params.get("docId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing docId", None);
    };

    let store = SqliteStore::new(conn);
    let doc = match store.get_document(doc_id) {
        Ok(Some(d)) => d,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "response document not found",
                Some(json!({ "docId": doc_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let questions = match bank::load_questions(conn, &doc.test_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let saved_marks = doc
        .evaluation
        .as_ref()
        .map(|e| e.text_marks.clone())
        .unwrap_or_default();

    let marking_rows: Vec<serde_json::Value> = questions
        .iter()
        .filter(|q| q.qtype == QuestionType::Text)
        .map(|q| {
            let scale = scoring::scale_for(&q.question_id, q.max_scale);
            let student_answer = doc
                .responses
                .iter()
                .find(|r| r.question_id == q.question_id)
                .map(|r| r.response.clone());
            // Previously saved mark, defaulted to 0 when absent or out of
            // scale.
            let saved_mark = saved_marks
                .get(&q.question_id)
                .map(|m| scale.normalize(*m))
                .unwrap_or(0);
            json!({
                "questionId": q.question_id,
                "questionText": q.question_text,
                "studentAnswer": student_answer,
                "scale": scale.values(),
                "savedMark": saved_mark,
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "docId": doc.doc_id,
            "roll": doc.roll,
            "testId": doc.test_id,
            "questions": marking_rows,
            "evaluation": doc
                .evaluation
                .as_ref()
                .and_then(|e| serde_json::to_value(e).ok())
                .unwrap_or(serde_json::Value::Null),
        }),
    )
}

fn handle_evaluation_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(doc_id) = req.params.get("docId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing docId", None);
    };
    let marks = match parse_text_marks(&req.params) {
        Ok(m) => m,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let store = SqliteStore::new(conn);
    let doc = match store.get_document(doc_id) {
        Ok(Some(d)) => d,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "response document not found",
                Some(json!({ "docId": doc_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let index = match bank::load_index(conn, &state.key_config, &doc.test_id) {
        Ok(i) => i,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match aggregate::preview_evaluation(&store, &index, doc_id, &marks) {
        Ok(outcome) => ok(&req.id, outcome_json(&outcome)),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn append_save_log(conn: &Connection, outcome: &SaveOutcome) -> anyhow::Result<String> {
    let log_id = Uuid::new_v4().to_string();
    let saved_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO save_log(id, doc_id, roll, final_total, grand_total, saved_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &log_id,
            &outcome.doc_id,
            &outcome.roll,
            outcome.evaluation.final_total.unwrap_or(0),
            outcome.grand_total,
            &saved_at,
        ),
    )?;
    Ok(saved_at)
}

fn handle_evaluation_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(doc_id) = req.params.get("docId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing docId", None);
    };
    let marks = match parse_text_marks(&req.params) {
        Ok(m) => m,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let store = SqliteStore::new(conn);
    let doc = match store.get_document(doc_id) {
        Ok(Some(d)) => d,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "response document not found",
                Some(json!({ "docId": doc_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let index = match bank::load_index(conn, &state.key_config, &doc.test_id) {
        Ok(i) => i,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if index.is_empty() {
        // Saving still succeeds, but every contribution degrades to 0.
        warn!(test_id = %doc.test_id, "no question bank for test; objective scores degrade to 0");
    }

    match aggregate::save_evaluation(&store, &index, &state.locks, doc_id, &marks) {
        Ok(outcome) => {
            let saved_at = match append_save_log(conn, &outcome) {
                Ok(ts) => Some(ts),
                Err(e) => {
                    // The save itself is committed; a missing audit row is a
                    // diagnostics gap, not a failed save.
                    warn!(doc_id, error = %e, "failed to append save audit row");
                    None
                }
            };
            let mut result = outcome_json(&outcome);
            result["savedAt"] = match saved_at {
                Some(ts) => json!(ts),
                None => serde_json::Value::Null,
            };
            ok(&req.id, result)
        }
        Err(e) => err(&req.id, "save_failed", e.to_string(), None),
    }
}

fn handle_evaluation_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(doc_id) = req.params.get("docId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing docId", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, roll, final_total, grand_total, saved_at
         FROM save_log
         WHERE doc_id = ?
         ORDER BY saved_at, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([doc_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "docId": doc_id,
                "roll": r.get::<_, String>(1)?,
                "finalTotal": r.get::<_, i64>(2)?,
                "grandTotal": r.get::<_, i64>(3)?,
                "savedAt": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(saves) => ok(&req.id, json!({ "docId": doc_id, "saves": saves })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evaluation.open" => Some(handle_evaluation_open(state, req)),
        "evaluation.preview" => Some(handle_evaluation_preview(state, req)),
        "evaluation.save" => Some(handle_evaluation_save(state, req)),
        "evaluation.history" => Some(handle_evaluation_history(state, req)),
        _ => None,
    }
}
