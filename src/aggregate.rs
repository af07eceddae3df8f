use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context};
use tracing::warn;

use crate::bank::AnswerKeyIndex;
use crate::scoring;
use crate::store::{Evaluation, EvaluationPatch, ResponseStore};

/// Advisory per-student locks. A save holds its student's lock across the
/// whole read-aggregate-write sequence; without that, two saves for the
/// same student's different tests can each aggregate a pre-update view of
/// the other and persist an undercounted grand total.
#[derive(Default)]
pub struct StudentLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StudentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, roll: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(roll.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    pub doc_id: String,
    pub roll: String,
    pub evaluation: Evaluation,
    pub grand_total: i64,
    pub sibling_docs: usize,
}

/// Sum of last-persisted final totals across the student's other documents.
/// A sibling that is absent or unevaluated contributes 0; a failed sibling
/// read also contributes 0 but silently lowers the grand total, so it is
/// logged as a data-quality warning.
fn sibling_final_totals(
    store: &dyn ResponseStore,
    roll: &str,
    own_doc_id: &str,
) -> anyhow::Result<(i64, Vec<String>)> {
    let doc_ids = store
        .docs_for_student(roll)
        .with_context(|| format!("failed to enumerate documents for roll {}", roll))?;

    let mut sum = 0;
    let mut siblings = Vec::new();
    for doc_id in doc_ids {
        if doc_id == own_doc_id {
            continue;
        }
        match store.get_document(&doc_id) {
            Ok(Some(doc)) => {
                sum += doc.evaluation.and_then(|e| e.final_total).unwrap_or(0);
            }
            Ok(None) => {
                warn!(doc_id = %doc_id, roll = %roll, "listed sibling document missing; counting 0");
            }
            Err(e) => {
                warn!(doc_id = %doc_id, roll = %roll, error = %e, "sibling read failed; counting 0");
            }
        }
        siblings.push(doc_id);
    }
    Ok((sum, siblings))
}

/// Save the evaluation of one document and re-propagate the student's grand
/// total. Protocol, under the student's lock:
/// recompute the document's evaluation from its current inputs, sum the
/// siblings' persisted final totals, write the full record, then merge the
/// grand total alone onto every sibling.
pub fn save_evaluation(
    store: &dyn ResponseStore,
    index: &AnswerKeyIndex,
    locks: &StudentLocks,
    doc_id: &str,
    marks: &BTreeMap<String, i64>,
) -> anyhow::Result<SaveOutcome> {
    let doc = store
        .get_document(doc_id)?
        .ok_or_else(|| anyhow!("document not found: {}", doc_id))?;

    let lock = locks.handle(&doc.roll);
    let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

    let mut evaluation = scoring::compute_record(index, &doc.responses, marks);
    let (sibling_sum, siblings) = sibling_final_totals(store, &doc.roll, doc_id)?;
    let grand_total = evaluation.final_total.unwrap_or(0) + sibling_sum;
    evaluation.grand_total = Some(grand_total);

    // The authoritative record must land; failing here fails the save.
    store
        .merge_write(doc_id, &EvaluationPatch::full(&evaluation))
        .with_context(|| format!("failed to save evaluation for {}", doc_id))?;

    let mut stale: Vec<String> = Vec::new();
    for sibling in &siblings {
        if let Err(e) = store.merge_write(sibling, &EvaluationPatch::grand_total_only(grand_total))
        {
            warn!(doc_id = %sibling, error = %e, "grand total propagation failed");
            stale.push(sibling.clone());
        }
    }
    if !stale.is_empty() {
        return Err(anyhow!(
            "evaluation saved but grand total propagation failed for: {}",
            stale.join(", ")
        ));
    }

    Ok(SaveOutcome {
        doc_id: doc_id.to_string(),
        roll: doc.roll,
        evaluation,
        grand_total,
        sibling_docs: siblings.len(),
    })
}

/// Compute what a save would persist, without taking the lock or writing
/// anything.
pub fn preview_evaluation(
    store: &dyn ResponseStore,
    index: &AnswerKeyIndex,
    doc_id: &str,
    marks: &BTreeMap<String, i64>,
) -> anyhow::Result<SaveOutcome> {
    let doc = store
        .get_document(doc_id)?
        .ok_or_else(|| anyhow!("document not found: {}", doc_id))?;

    let mut evaluation = scoring::compute_record(index, &doc.responses, marks);
    let (sibling_sum, siblings) = sibling_final_totals(store, &doc.roll, doc_id)?;
    let grand_total = evaluation.final_total.unwrap_or(0) + sibling_sum;
    evaluation.grand_total = Some(grand_total);

    Ok(SaveOutcome {
        doc_id: doc_id.to_string(),
        roll: doc.roll,
        evaluation,
        grand_total,
        sibling_docs: siblings.len(),
    })
}
