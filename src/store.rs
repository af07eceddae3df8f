use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One submitted answer. Immutable once the document is imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRow {
    pub question_id: String,
    pub response: String,
}

/// The evaluation sub-record persisted on a response document. Fields are
/// optional because merge writes can leave a document with a partial
/// record: a sibling that has only ever received a grand-total merge has no
/// final total of its own, which is distinct from a saved total of 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcq_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likert_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_total: Option<i64>,
    #[serde(default)]
    pub text_marks: BTreeMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grand_total: Option<i64>,
}

/// One (student, test) response document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDoc {
    pub doc_id: String,
    pub roll: String,
    pub test_id: String,
    pub responses: Vec<ResponseRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
}

/// Partial evaluation update. Fields left as None keep their stored values;
/// the write never touches the document's roll/test/responses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationPatch {
    pub mcq_total: Option<i64>,
    pub likert_total: Option<i64>,
    pub text_total: Option<i64>,
    pub text_marks: Option<BTreeMap<String, i64>>,
    pub final_total: Option<i64>,
    pub grand_total: Option<i64>,
}

impl EvaluationPatch {
    pub fn full(eval: &Evaluation) -> Self {
        Self {
            mcq_total: eval.mcq_total,
            likert_total: eval.likert_total,
            text_total: eval.text_total,
            text_marks: Some(eval.text_marks.clone()),
            final_total: eval.final_total,
            grand_total: eval.grand_total,
        }
    }

    pub fn grand_total_only(grand_total: i64) -> Self {
        Self {
            grand_total: Some(grand_total),
            ..Self::default()
        }
    }
}

/// Response-document store as seen by the scoring core. The production
/// implementation is SQLite; tests substitute an in-memory store so the
/// aggregation protocol can be exercised across threads.
pub trait ResponseStore {
    fn get_document(&self, doc_id: &str) -> anyhow::Result<Option<ResponseDoc>>;
    fn merge_write(&self, doc_id: &str, patch: &EvaluationPatch) -> anyhow::Result<()>;
    fn docs_for_student(&self, roll: &str) -> anyhow::Result<Vec<String>>;
}

pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Register a new response document. Documents are immutable once
    /// imported; re-importing an existing doc id is an error.
    pub fn insert_document(
        &self,
        doc_id: &str,
        roll: &str,
        test_id: &str,
        responses: &[ResponseRow],
    ) -> anyhow::Result<()> {
        let imported_at = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO response_docs(doc_id, roll, test_id, imported_at)
             VALUES(?, ?, ?, ?)",
            (doc_id, roll, test_id, &imported_at),
        )?;
        for (i, r) in responses.iter().enumerate() {
            self.conn.execute(
                "INSERT INTO responses(doc_id, question_id, response, sort_order)
                 VALUES(?, ?, ?, ?)
                 ON CONFLICT(doc_id, question_id) DO UPDATE SET
                   response = excluded.response",
                (doc_id, &r.question_id, &r.response, i as i64),
            )?;
        }
        Ok(())
    }

    pub fn document_exists(&self, doc_id: &str) -> anyhow::Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT doc_id FROM response_docs WHERE doc_id = ?",
                [doc_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Distinct rolls with an evaluated flag: true when any of the roll's
    /// documents carries a persisted grand total.
    pub fn list_students(&self) -> anyhow::Result<Vec<(String, bool)>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.roll,
                    MAX(CASE WHEN e.grand_total IS NOT NULL THEN 1 ELSE 0 END)
             FROM response_docs d
             LEFT JOIN evaluations e ON e.doc_id = d.doc_id
             GROUP BY d.roll
             ORDER BY d.roll",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_all_doc_ids(&self) -> anyhow::Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT doc_id FROM response_docs ORDER BY roll, test_id")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn load_responses(&self, doc_id: &str) -> anyhow::Result<Vec<ResponseRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT question_id, response
             FROM responses
             WHERE doc_id = ?
             ORDER BY sort_order",
        )?;
        let rows = stmt
            .query_map([doc_id], |r| {
                Ok(ResponseRow {
                    question_id: r.get(0)?,
                    response: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn load_evaluation(&self, doc_id: &str) -> anyhow::Result<Option<Evaluation>> {
        let row: Option<(
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<String>,
            Option<i64>,
            Option<i64>,
        )> = self
            .conn
            .query_row(
                "SELECT mcq_total, likert_total, text_total, text_marks, final_total, grand_total
                 FROM evaluations
                 WHERE doc_id = ?",
                [doc_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((mcq_total, likert_total, text_total, text_marks, final_total, grand_total)) = row
        else {
            return Ok(None);
        };

        let text_marks: BTreeMap<String, i64> = match text_marks {
            Some(s) => serde_json::from_str(&s).unwrap_or_default(),
            None => BTreeMap::new(),
        };

        Ok(Some(Evaluation {
            mcq_total,
            likert_total,
            text_total,
            text_marks,
            final_total,
            grand_total,
        }))
    }
}

impl ResponseStore for SqliteStore<'_> {
    fn get_document(&self, doc_id: &str) -> anyhow::Result<Option<ResponseDoc>> {
        let head: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT roll, test_id FROM response_docs WHERE doc_id = ?",
                [doc_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((roll, test_id)) = head else {
            return Ok(None);
        };

        Ok(Some(ResponseDoc {
            doc_id: doc_id.to_string(),
            roll,
            test_id,
            responses: self.load_responses(doc_id)?,
            evaluation: self.load_evaluation(doc_id)?,
        }))
    }

    fn merge_write(&self, doc_id: &str, patch: &EvaluationPatch) -> anyhow::Result<()> {
        let text_marks_json = match &patch.text_marks {
            Some(m) => Some(serde_json::to_string(m)?),
            None => None,
        };
        // COALESCE keeps the stored value for every field the patch leaves
        // unset, which is what gives the write its merge semantics.
        self.conn.execute(
            "INSERT INTO evaluations(doc_id, mcq_total, likert_total, text_total, text_marks, final_total, grand_total, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
             ON CONFLICT(doc_id) DO UPDATE SET
               mcq_total = COALESCE(excluded.mcq_total, evaluations.mcq_total),
               likert_total = COALESCE(excluded.likert_total, evaluations.likert_total),
               text_total = COALESCE(excluded.text_total, evaluations.text_total),
               text_marks = COALESCE(excluded.text_marks, evaluations.text_marks),
               final_total = COALESCE(excluded.final_total, evaluations.final_total),
               grand_total = COALESCE(excluded.grand_total, evaluations.grand_total),
               updated_at = excluded.updated_at",
            (
                doc_id,
                patch.mcq_total,
                patch.likert_total,
                patch.text_total,
                text_marks_json,
                patch.final_total,
                patch.grand_total,
            ),
        )?;
        Ok(())
    }

    fn docs_for_student(&self, roll: &str) -> anyhow::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT doc_id FROM response_docs WHERE roll = ? ORDER BY test_id",
        )?;
        let rows = stmt
            .query_map([roll], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub fn default_doc_id(roll: &str, test_id: &str) -> String {
    format!("{}_{}", roll, test_id)
}
