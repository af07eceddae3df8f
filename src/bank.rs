use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashMap;

// Imported bank rows come from heterogeneous sources; identifiers, question
// text, and scales are probed from a few accepted column spellings. The
// correct-answer columns are configuration (AnswerKeyConfig) because that
// list is the one that actually varies between source schemas.
const QUESTION_ID_COLUMNS: &[&str] = &["QuestionID", "QuestionId", "QID", "Id"];
const QUESTION_TEXT_COLUMNS: &[&str] = &["Question", "QuestionText", "Text"];
const MAX_SCALE_COLUMNS: &[&str] = &["MaxMarks", "MaxScale", "OutOf"];

pub const DEFAULT_ANSWER_COLUMNS: &[&str] = &[
    "Answer",
    "Correct",
    "CorrectAnswer",
    "Ans",
    "AnswerKey",
    "RightAnswer",
];

#[derive(Debug, Clone)]
pub struct AnswerKeyConfig {
    /// Probed in order against the raw bank row; first usable value wins.
    pub answer_columns: Vec<String>,
}

impl Default for AnswerKeyConfig {
    fn default() -> Self {
        Self {
            answer_columns: DEFAULT_ANSWER_COLUMNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionType {
    Mcq,
    Likert,
    Text,
}

impl QuestionType {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "mcq" => Some(Self::Mcq),
            "likert" => Some(Self::Likert),
            "short" | "text" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mcq => "mcq",
            Self::Likert => "likert",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuestionRow {
    pub question_id: String,
    pub qtype: QuestionType,
    pub max_scale: Option<i64>,
    pub question_text: String,
    pub raw: Value,
    pub sort_order: i64,
}

#[derive(Debug)]
pub struct ParsedBank {
    pub rows: Vec<QuestionRow>,
    pub skipped: usize,
}

/// Parse imported bank rows. Rows without a usable question id or type tag
/// are skipped and counted, never fatal.
pub fn parse_question_rows(raw_rows: &[Value]) -> ParsedBank {
    let mut rows: Vec<QuestionRow> = Vec::new();
    let mut skipped = 0usize;

    for raw in raw_rows {
        let Some(question_id) = probe_text(raw, QUESTION_ID_COLUMNS) else {
            skipped += 1;
            continue;
        };
        let qtype = probe_text(raw, &["Type"]).and_then(|t| QuestionType::parse(&t));
        let Some(qtype) = qtype else {
            skipped += 1;
            continue;
        };
        let question_text = probe_text(raw, QUESTION_TEXT_COLUMNS).unwrap_or_default();
        let max_scale = match qtype {
            QuestionType::Text => probe_i64(raw, MAX_SCALE_COLUMNS).filter(|m| *m >= 1),
            _ => None,
        };
        let sort_order = rows.len() as i64;
        rows.push(QuestionRow {
            question_id,
            qtype,
            max_scale,
            question_text,
            raw: raw.clone(),
            sort_order,
        });
    }

    ParsedBank { rows, skipped }
}

fn probe_text(row: &Value, columns: &[&str]) -> Option<String> {
    let obj = row.as_object()?;
    for col in columns {
        let Some(v) = obj.get(*col) else {
            continue;
        };
        let text = match v {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

fn probe_i64(row: &Value, columns: &[&str]) -> Option<i64> {
    let obj = row.as_object()?;
    for col in columns {
        let Some(v) = obj.get(*col) else {
            continue;
        };
        match v {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Some(i);
                }
            }
            Value::String(s) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyEntry {
    Mcq { correct: Option<String> },
    Likert,
    Text { max_scale: Option<i64> },
}

/// Lookup from question id to its type and scoring metadata, for one test.
#[derive(Debug, Default)]
pub struct AnswerKeyIndex {
    entries: HashMap<String, KeyEntry>,
}

impl AnswerKeyIndex {
    pub fn build(cfg: &AnswerKeyConfig, rows: &[QuestionRow]) -> Self {
        let mut entries = HashMap::with_capacity(rows.len());
        for row in rows {
            let entry = match row.qtype {
                QuestionType::Mcq => KeyEntry::Mcq {
                    correct: probe_correct_answer(cfg, &row.raw),
                },
                QuestionType::Likert => KeyEntry::Likert,
                QuestionType::Text => KeyEntry::Text {
                    max_scale: row.max_scale,
                },
            };
            entries.insert(row.question_id.clone(), entry);
        }
        Self { entries }
    }

    pub fn get(&self, question_id: &str) -> Option<&KeyEntry> {
        self.entries.get(question_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn probe_correct_answer(cfg: &AnswerKeyConfig, raw: &Value) -> Option<String> {
    let columns: Vec<&str> = cfg.answer_columns.iter().map(|s| s.as_str()).collect();
    probe_text(raw, &columns)
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub test_id: String,
    pub imported: usize,
    pub skipped: usize,
}

pub fn import_test(
    conn: &Connection,
    test_id: &str,
    title: &str,
    raw_rows: &[Value],
) -> anyhow::Result<ImportSummary> {
    let parsed = parse_question_rows(raw_rows);

    let imported_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO tests(id, title, imported_at)
         VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           title = excluded.title,
           imported_at = excluded.imported_at",
        (test_id, title, &imported_at),
    )?;

    // Re-import replaces the bank wholesale; questions carry no state.
    conn.execute("DELETE FROM questions WHERE test_id = ?", [test_id])?;
    for row in &parsed.rows {
        conn.execute(
            "INSERT INTO questions(test_id, question_id, sort_order, qtype, max_scale, question_text, raw_row)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                test_id,
                &row.question_id,
                row.sort_order,
                row.qtype.as_str(),
                row.max_scale,
                &row.question_text,
                serde_json::to_string(&row.raw)?,
            ),
        )?;
    }

    Ok(ImportSummary {
        test_id: test_id.to_string(),
        imported: parsed.rows.len(),
        skipped: parsed.skipped,
    })
}

/// Questions for a test in bank order. An unknown test id yields an empty
/// list so scoring degrades to zero contribution instead of failing.
pub fn load_questions(conn: &Connection, test_id: &str) -> anyhow::Result<Vec<QuestionRow>> {
    let mut stmt = conn.prepare(
        "SELECT question_id, qtype, max_scale, question_text, raw_row, sort_order
         FROM questions
         WHERE test_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([test_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<i64>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, i64>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (question_id, qtype, max_scale, question_text, raw_row, sort_order) in rows {
        let Some(qtype) = QuestionType::parse(&qtype) else {
            continue;
        };
        let raw = serde_json::from_str(&raw_row).unwrap_or(Value::Null);
        out.push(QuestionRow {
            question_id,
            qtype,
            max_scale,
            question_text,
            raw,
            sort_order,
        });
    }
    Ok(out)
}

pub fn load_index(
    conn: &Connection,
    cfg: &AnswerKeyConfig,
    test_id: &str,
) -> anyhow::Result<AnswerKeyIndex> {
    let rows = load_questions(conn, test_id)?;
    Ok(AnswerKeyIndex::build(cfg, &rows))
}

#[derive(Debug, Clone)]
pub struct TestSummary {
    pub id: String,
    pub title: String,
    pub question_count: i64,
    pub has_mcq: bool,
    pub has_likert: bool,
    pub has_text: bool,
}

pub fn list_tests(conn: &Connection) -> anyhow::Result<Vec<TestSummary>> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.title,
                COUNT(q.question_id),
                MAX(CASE WHEN q.qtype = 'mcq' THEN 1 ELSE 0 END),
                MAX(CASE WHEN q.qtype = 'likert' THEN 1 ELSE 0 END),
                MAX(CASE WHEN q.qtype = 'text' THEN 1 ELSE 0 END)
         FROM tests t
         LEFT JOIN questions q ON q.test_id = t.id
         GROUP BY t.id, t.title
         ORDER BY t.id",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(TestSummary {
                id: r.get(0)?,
                title: r.get(1)?,
                question_count: r.get(2)?,
                has_mcq: r.get::<_, i64>(3)? != 0,
                has_likert: r.get::<_, i64>(4)? != 0,
                has_text: r.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_normalizes_type_tags_and_counts_skips() {
        let rows = vec![
            json!({ "QuestionID": "Q1", "Type": "  MCQ ", "Question": "Pick one", "Answer": "B" }),
            json!({ "QuestionID": "Q2", "Type": "Likert", "Question": "Rate it" }),
            json!({ "QuestionID": "Q3", "Type": "short", "Question": "Explain" }),
            json!({ "QuestionID": "Q4", "Type": "essay", "Question": "unsupported type" }),
            json!({ "Type": "mcq", "Question": "no id" }),
        ];
        let parsed = parse_question_rows(&rows);
        assert_eq!(parsed.rows.len(), 3);
        assert_eq!(parsed.skipped, 2);
        assert_eq!(parsed.rows[0].qtype, QuestionType::Mcq);
        assert_eq!(parsed.rows[1].qtype, QuestionType::Likert);
        assert_eq!(parsed.rows[2].qtype, QuestionType::Text);
        assert_eq!(parsed.rows[2].sort_order, 2);
    }

    #[test]
    fn correct_answer_probe_respects_priority_order() {
        let cfg = AnswerKeyConfig::default();
        let row = json!({ "CorrectAnswer": "C", "Answer": "B" });
        assert_eq!(probe_correct_answer(&cfg, &row), Some("B".to_string()));

        let row = json!({ "CorrectAnswer": "  C  " });
        assert_eq!(probe_correct_answer(&cfg, &row), Some("C".to_string()));

        // Blank and null values are not answers.
        let row = json!({ "Answer": "   ", "RightAnswer": "D" });
        assert_eq!(probe_correct_answer(&cfg, &row), Some("D".to_string()));

        let row = json!({ "Hint": "not an answer column" });
        assert_eq!(probe_correct_answer(&cfg, &row), None);
    }

    #[test]
    fn numeric_answers_are_accepted_as_text() {
        let cfg = AnswerKeyConfig::default();
        let row = json!({ "Answer": 42 });
        assert_eq!(probe_correct_answer(&cfg, &row), Some("42".to_string()));
    }

    #[test]
    fn index_carries_type_and_metadata() {
        let cfg = AnswerKeyConfig::default();
        let rows = vec![
            json!({ "QuestionID": "Q1", "Type": "mcq", "Question": "q", "Answer": "A" }),
            json!({ "QuestionID": "Q2", "Type": "likert", "Question": "q" }),
            json!({ "QuestionID": "Q13", "Type": "short", "Question": "q", "MaxMarks": 3 }),
        ];
        let parsed = parse_question_rows(&rows);
        let index = AnswerKeyIndex::build(&cfg, &parsed.rows);
        assert_eq!(index.len(), 3);
        assert_eq!(
            index.get("Q1"),
            Some(&KeyEntry::Mcq {
                correct: Some("A".to_string())
            })
        );
        assert_eq!(index.get("Q2"), Some(&KeyEntry::Likert));
        assert_eq!(index.get("Q13"), Some(&KeyEntry::Text { max_scale: Some(3) }));
        assert_eq!(index.get("Q99"), None);
    }
}
