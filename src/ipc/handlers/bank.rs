use crate::bank;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use serde_json::json;
use tracing::warn;

fn handle_bank_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let test_id = match req.params.get("testId").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing testId", None),
    };
    let title = req
        .params
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or(&test_id)
        .to_string();
    let Some(questions) = req.params.get("questions").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "questions must be an array", None);
    };

    match bank::import_test(conn, &test_id, &title, questions) {
        Ok(summary) => {
            if summary.skipped > 0 {
                warn!(
                    test_id = %summary.test_id,
                    skipped = summary.skipped,
                    "bank rows skipped during import"
                );
            }
            ok(
                &req.id,
                json!({
                    "testId": summary.test_id,
                    "imported": summary.imported,
                    "skipped": summary.skipped,
                }),
            )
        }
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_bank_tests(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    match bank::list_tests(conn) {
        Ok(tests) => {
            let rows: Vec<serde_json::Value> = tests
                .iter()
                .map(|t| {
                    json!({
                        "id": t.id,
                        "title": t.title,
                        "questionCount": t.question_count,
                        "hasMcq": t.has_mcq,
                        "hasLikert": t.has_likert,
                        "hasText": t.has_text,
                    })
                })
                .collect();
            ok(&req.id, json!({ "tests": rows }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_bank_answer_key(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(test_id) = req.params.get("testId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing testId", None);
    };

    let questions = match bank::load_questions(conn, test_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let entries: Vec<serde_json::Value> = questions
        .iter()
        .map(|q| {
            let mut entry = json!({
                "questionId": q.question_id,
                "type": q.qtype.as_str(),
            });
            match q.qtype {
                bank::QuestionType::Mcq => {
                    entry["correctAnswer"] =
                        match bank::probe_correct_answer(&state.key_config, &q.raw) {
                            Some(a) => json!(a),
                            None => serde_json::Value::Null,
                        };
                }
                bank::QuestionType::Text => {
                    entry["maxScale"] = json!(scoring::scale_for(&q.question_id, q.max_scale).max);
                }
                bank::QuestionType::Likert => {}
            }
            entry
        })
        .collect();

    ok(
        &req.id,
        json!({ "testId": test_id, "entries": entries }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "bank.import" => Some(handle_bank_import(state, req)),
        "bank.tests" => Some(handle_bank_tests(state, req)),
        "bank.answerKey" => Some(handle_bank_answer_key(state, req)),
        _ => None,
    }
}
