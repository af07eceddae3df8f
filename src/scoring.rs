use std::collections::BTreeMap;

use crate::bank::{AnswerKeyIndex, KeyEntry};
use crate::store::{Evaluation, ResponseRow};

// Static ordinal -> scale groups for free-text questions without an explicit
// max scale in the bank row.
const FOUR_MARK_ORDINALS: &[i64] = &[12, 13, 14, 16, 17, 18];
const THREE_MARK_ORDINALS: &[i64] = &[22, 23, 24, 25, 28, 29, 30, 34];

const LIKERT_MAX_SCORE: i64 = 4;

/// Count of responses whose value exactly equals the key's correct answer.
/// Comparison is case-sensitive on trimmed text; no partial credit.
pub fn score_multiple_choice(index: &AnswerKeyIndex, responses: &[ResponseRow]) -> i64 {
    let mut total = 0;
    for r in responses {
        let Some(KeyEntry::Mcq { correct }) = index.get(&r.question_id) else {
            continue;
        };
        let Some(correct) = correct else {
            continue;
        };
        if r.response.trim() == correct.as_str() {
            total += 1;
        }
    }
    total
}

/// Sum of mapped Likert responses: raw 1..5 -> 0..4 via clamp(v - 1, 0, 4).
/// Out-of-range values clamp; unparseable values contribute 0.
pub fn score_likert(index: &AnswerKeyIndex, responses: &[ResponseRow]) -> i64 {
    let mut total = 0;
    for r in responses {
        let Some(KeyEntry::Likert) = index.get(&r.question_id) else {
            continue;
        };
        let Ok(v) = r.response.trim().parse::<i64>() else {
            continue;
        };
        total += (v - 1).clamp(0, LIKERT_MAX_SCORE);
    }
    total
}

/// Award scale for a free-text question: the integers 0..=max.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkScale {
    pub max: i64,
}

impl MarkScale {
    pub fn contains(self, mark: i64) -> bool {
        (0..=self.max).contains(&mark)
    }

    /// Out-of-scale marks (negative or above max) normalize to 0; they are
    /// never stored verbatim.
    pub fn normalize(self, mark: i64) -> i64 {
        if self.contains(mark) {
            mark
        } else {
            0
        }
    }

    pub fn values(self) -> Vec<i64> {
        (0..=self.max).collect()
    }
}

/// Numeric ordinal of a question id: leading non-digit prefix stripped
/// ("Q13" -> 13), remainder parsed as an integer.
pub fn parse_ordinal(question_id: &str) -> Option<i64> {
    let digits = question_id.trim().trim_start_matches(|c: char| !c.is_ascii_digit());
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok()
}

/// Scale for a free-text question. An explicit bank scale wins; otherwise
/// the static ordinal groups apply, and unparseable ids get the narrowest
/// scale.
pub fn scale_for(question_id: &str, explicit_max: Option<i64>) -> MarkScale {
    if let Some(max) = explicit_max.filter(|m| *m >= 1) {
        return MarkScale { max };
    }
    match parse_ordinal(question_id) {
        Some(ordinal) if FOUR_MARK_ORDINALS.contains(&ordinal) => MarkScale { max: 3 },
        Some(ordinal) if THREE_MARK_ORDINALS.contains(&ordinal) => MarkScale { max: 2 },
        _ => MarkScale { max: 1 },
    }
}

/// Normalize a submitted mark ledger against the test's free-text
/// questions: marks for unknown or non-text question ids are dropped, and
/// every kept mark is clamped into its question's scale.
pub fn normalize_marks(
    index: &AnswerKeyIndex,
    marks: &BTreeMap<String, i64>,
) -> BTreeMap<String, i64> {
    let mut out = BTreeMap::new();
    for (question_id, mark) in marks {
        let Some(KeyEntry::Text { max_scale }) = index.get(question_id) else {
            tracing::debug!(question_id = %question_id, "dropping mark for unknown free-text question");
            continue;
        };
        let scale = scale_for(question_id, *max_scale);
        out.insert(question_id.clone(), scale.normalize(*mark));
    }
    out
}

pub fn manual_total(marks: &BTreeMap<String, i64>) -> i64 {
    marks.values().sum()
}

/// Assemble the evaluation for one document from its current inputs. Pure:
/// no store access, no side effects; persistence is a separate step so a
/// marker can preview a total before committing it.
pub fn compute_record(
    index: &AnswerKeyIndex,
    responses: &[ResponseRow],
    marks: &BTreeMap<String, i64>,
) -> Evaluation {
    let mcq_total = score_multiple_choice(index, responses);
    let likert_total = score_likert(index, responses);
    let text_marks = normalize_marks(index, marks);
    let text_total = manual_total(&text_marks);
    Evaluation {
        mcq_total: Some(mcq_total),
        likert_total: Some(likert_total),
        text_total: Some(text_total),
        final_total: Some(mcq_total + likert_total + text_total),
        text_marks,
        grand_total: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::{parse_question_rows, AnswerKeyConfig, AnswerKeyIndex};
    use serde_json::json;

    fn index(rows: Vec<serde_json::Value>) -> AnswerKeyIndex {
        let parsed = parse_question_rows(&rows);
        AnswerKeyIndex::build(&AnswerKeyConfig::default(), &parsed.rows)
    }

    fn resp(question_id: &str, response: &str) -> ResponseRow {
        ResponseRow {
            question_id: question_id.to_string(),
            response: response.to_string(),
        }
    }

    #[test]
    fn mcq_counts_exact_matches_only() {
        let idx = index(vec![
            json!({ "QuestionID": "Q1", "Type": "mcq", "Question": "q", "Answer": "B" }),
            json!({ "QuestionID": "Q2", "Type": "mcq", "Question": "q", "Answer": "Paris" }),
            json!({ "QuestionID": "Q3", "Type": "likert", "Question": "q" }),
        ]);

        let responses = vec![
            resp("Q1", " B "),
            resp("Q2", "paris"), // case-sensitive: no credit
            resp("Q3", "B"),     // not an MCQ question
            resp("Q9", "B"),     // not in the bank
        ];
        assert_eq!(score_multiple_choice(&idx, &responses), 1);

        // Unrelated extra/missing responses do not change the count.
        let fewer = vec![resp("Q1", "B")];
        assert_eq!(score_multiple_choice(&idx, &fewer), 1);
    }

    #[test]
    fn mcq_question_without_answer_key_scores_zero() {
        let idx = index(vec![
            json!({ "QuestionID": "Q1", "Type": "mcq", "Question": "q" }),
        ]);
        assert_eq!(score_multiple_choice(&idx, &[resp("Q1", "A")]), 0);
    }

    #[test]
    fn likert_maps_linearly_and_clamps() {
        let idx = index(vec![
            json!({ "QuestionID": "L1", "Type": "likert", "Question": "q" }),
        ]);
        for (raw, want) in [("1", 0), ("2", 1), ("3", 2), ("4", 3), ("5", 4)] {
            assert_eq!(score_likert(&idx, &[resp("L1", raw)]), want, "raw {raw}");
        }
        assert_eq!(score_likert(&idx, &[resp("L1", "0")]), 0);
        assert_eq!(score_likert(&idx, &[resp("L1", "6")]), 4);
        assert_eq!(score_likert(&idx, &[resp("L1", "-3")]), 0);
        assert_eq!(score_likert(&idx, &[resp("L1", "agree")]), 0);
    }

    #[test]
    fn ordinal_parsing_strips_prefix() {
        assert_eq!(parse_ordinal("Q13"), Some(13));
        assert_eq!(parse_ordinal("13"), Some(13));
        assert_eq!(parse_ordinal(" q22 "), Some(22));
        assert_eq!(parse_ordinal("Qx"), None);
        assert_eq!(parse_ordinal(""), None);
    }

    #[test]
    fn scale_groups_match_ordinal_tables() {
        assert_eq!(scale_for("Q13", None), MarkScale { max: 3 });
        assert_eq!(scale_for("17", None), MarkScale { max: 3 });
        assert_eq!(scale_for("Q22", None), MarkScale { max: 2 });
        assert_eq!(scale_for("34", None), MarkScale { max: 2 });
        assert_eq!(scale_for("Q5", None), MarkScale { max: 1 });
        // Unparseable ids get the narrowest scale.
        assert_eq!(scale_for("intro", None), MarkScale { max: 1 });
        // An explicit bank scale wins over the static table.
        assert_eq!(scale_for("Q13", Some(5)), MarkScale { max: 5 });
        assert_eq!(scale_for("Q13", Some(0)), MarkScale { max: 3 });
    }

    #[test]
    fn out_of_scale_marks_normalize_to_zero() {
        let idx = index(vec![
            json!({ "QuestionID": "Q13", "Type": "short", "Question": "q" }),
            json!({ "QuestionID": "Q22", "Type": "short", "Question": "q" }),
        ]);
        let marks = BTreeMap::from([
            ("Q13".to_string(), 4),  // above the 0..=3 scale
            ("Q22".to_string(), 2),  // in scale
            ("Q99".to_string(), 1),  // unknown question
        ]);
        let normalized = normalize_marks(&idx, &marks);
        assert_eq!(normalized.get("Q13"), Some(&0));
        assert_eq!(normalized.get("Q22"), Some(&2));
        assert_eq!(normalized.get("Q99"), None);

        let negative = BTreeMap::from([("Q13".to_string(), -1)]);
        assert_eq!(normalize_marks(&idx, &negative).get("Q13"), Some(&0));
    }

    #[test]
    fn manual_total_is_idempotent() {
        let marks = BTreeMap::from([
            ("Q13".to_string(), 3),
            ("Q22".to_string(), 1),
            ("Q5".to_string(), 1),
        ]);
        assert_eq!(manual_total(&marks), 5);
        assert_eq!(manual_total(&marks), manual_total(&marks));
    }

    #[test]
    fn compute_record_is_pure() {
        let idx = index(vec![
            json!({ "QuestionID": "Q1", "Type": "mcq", "Question": "q", "Answer": "A" }),
            json!({ "QuestionID": "L1", "Type": "likert", "Question": "q" }),
            json!({ "QuestionID": "Q13", "Type": "short", "Question": "q" }),
        ]);
        let responses = vec![resp("Q1", "A"), resp("L1", "5"), resp("Q13", "free text")];
        let marks = BTreeMap::from([("Q13".to_string(), 2)]);

        let first = compute_record(&idx, &responses, &marks);
        let second = compute_record(&idx, &responses, &marks);
        assert_eq!(first, second);
        assert_eq!(first.mcq_total, Some(1));
        assert_eq!(first.likert_total, Some(4));
        assert_eq!(first.text_total, Some(2));
        assert_eq!(first.final_total, Some(7));
        assert_eq!(first.grand_total, None);
    }

    #[test]
    fn empty_index_degrades_to_zero_contribution() {
        let idx = index(vec![]);
        let responses = vec![resp("Q1", "A")];
        let marks = BTreeMap::from([("Q13".to_string(), 2)]);
        let eval = compute_record(&idx, &responses, &marks);
        assert_eq!(eval.final_total, Some(0));
        assert!(eval.text_marks.is_empty());
    }
}
