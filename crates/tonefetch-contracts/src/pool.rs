//! Candidate pool construction across primary and fallback search queries.

use indexmap::IndexSet;
use serde::Serialize;

use crate::catalog::{Analysis, Tone};
use crate::error::PipelineError;

/// Pool size below which the fallback queries are attempted at all.
const FALLBACK_THRESHOLD: usize = 10;

/// Page size requested per search call; the service silently caps at 25.
pub const SEARCH_PAGE_SIZE: usize = 25;

/// Catalog search seam. The engine implements this over HTTP; tests use
/// in-memory fakes.
pub trait ToneSearch {
    fn search(
        &self,
        query: &str,
        gear: Option<&str>,
        page_size: usize,
    ) -> Result<Vec<Tone>, PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPhase {
    Primary,
    Fallback,
}

/// Per-query accounting, kept for event emission and the run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStat {
    pub query: String,
    pub phase: QueryPhase,
    pub found: usize,
    pub added: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolOutcome {
    pub tones: Vec<Tone>,
    pub queries: Vec<QueryStat>,
}

/// Builds the deduplicated candidate pool for one request.
///
/// Primary queries always run, in order. Fallback queries run only when the
/// primaries left the pool under the fixed threshold, and stop early once
/// the pool reaches `pool_target`. Membership is keyed by tone id; pool
/// order is first-seen order across the exact query execution order. A
/// failing query aborts the whole build.
pub fn build_pool<S: ToneSearch + ?Sized>(
    search: &S,
    analysis: &Analysis,
    per_query_cap: usize,
    pool_target: usize,
) -> Result<PoolOutcome, PipelineError> {
    let mut tones: Vec<Tone> = Vec::new();
    let mut seen: IndexSet<u64> = IndexSet::new();
    let mut queries: Vec<QueryStat> = Vec::new();

    for query in &analysis.search_queries {
        let rows = search.search(query, analysis.gear_type.as_deref(), SEARCH_PAGE_SIZE)?;
        let found = rows.len();
        let added = absorb(&mut tones, &mut seen, rows, per_query_cap);
        queries.push(QueryStat {
            query: query.clone(),
            phase: QueryPhase::Primary,
            found,
            added,
        });
    }

    if tones.len() < FALLBACK_THRESHOLD {
        for query in &analysis.fallback_queries {
            if tones.len() >= pool_target {
                break;
            }
            let rows = search.search(query, analysis.gear_type.as_deref(), SEARCH_PAGE_SIZE)?;
            let found = rows.len();
            let added = absorb(&mut tones, &mut seen, rows, per_query_cap);
            queries.push(QueryStat {
                query: query.clone(),
                phase: QueryPhase::Fallback,
                found,
                added,
            });
        }
    }

    Ok(PoolOutcome { tones, queries })
}

fn absorb(
    tones: &mut Vec<Tone>,
    seen: &mut IndexSet<u64>,
    rows: Vec<Tone>,
    per_query_cap: usize,
) -> usize {
    let mut added = 0;
    for tone in rows.into_iter().take(per_query_cap) {
        if seen.insert(tone.id) {
            tones.push(tone);
            added += 1;
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use crate::catalog::{Analysis, Tone};
    use crate::error::PipelineError;

    use super::{build_pool, QueryPhase, ToneSearch};

    struct FakeSearch {
        batches: RefCell<Vec<Vec<Tone>>>,
        calls: RefCell<Vec<String>>,
        fail_on: Option<String>,
    }

    impl FakeSearch {
        fn new(batches: Vec<Vec<Tone>>) -> Self {
            Self {
                batches: RefCell::new(batches),
                calls: RefCell::new(Vec::new()),
                fail_on: None,
            }
        }
    }

    impl ToneSearch for FakeSearch {
        fn search(
            &self,
            query: &str,
            _gear: Option<&str>,
            _page_size: usize,
        ) -> Result<Vec<Tone>, PipelineError> {
            self.calls.borrow_mut().push(query.to_string());
            if self.fail_on.as_deref() == Some(query) {
                return Err(PipelineError::ServiceRequestFailed {
                    service: "tone3000",
                    status: 500,
                    detail: "boom".to_string(),
                });
            }
            let mut batches = self.batches.borrow_mut();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(batches.remove(0))
            }
        }
    }

    fn tone(id: u64) -> Tone {
        serde_json::from_value(json!({"id": id, "title": format!("tone-{id}"), "gear": "amp"}))
            .expect("tone fixture")
    }

    fn tones(ids: &[u64]) -> Vec<Tone> {
        ids.iter().copied().map(tone).collect()
    }

    fn analysis(primary: &[&str], fallback: &[&str]) -> Analysis {
        Analysis {
            search_queries: primary.iter().map(|s| s.to_string()).collect(),
            gear_type: Some("amp".to_string()),
            description: "test".to_string(),
            fallback_queries: fallback.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn pool_dedups_by_id_preserving_first_seen_order() {
        let search = FakeSearch::new(vec![tones(&[1, 2, 3]), tones(&[3, 2, 4]), tones(&[5, 1])]);
        let outcome = build_pool(&search, &analysis(&["a", "b", "c"], &[]), 15, 15)
            .expect("pool");
        let ids: Vec<u64> = outcome.tones.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(outcome.queries.len(), 3);
        assert_eq!(outcome.queries[1].found, 3);
        assert_eq!(outcome.queries[1].added, 1);
        assert_eq!(outcome.queries[2].added, 1);
    }

    #[test]
    fn per_query_cap_limits_each_batch() {
        let search = FakeSearch::new(vec![tones(&[1, 2, 3, 4, 5])]);
        let outcome = build_pool(&search, &analysis(&["a"], &[]), 2, 15).expect("pool");
        let ids: Vec<u64> = outcome.tones.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn fallbacks_run_only_when_primaries_underfill() {
        // 10 unique tones from the primaries: fallbacks must not run.
        let search = FakeSearch::new(vec![tones(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])]);
        let outcome =
            build_pool(&search, &analysis(&["a"], &["x", "y"]), 15, 15).expect("pool");
        assert_eq!(outcome.tones.len(), 10);
        assert_eq!(search.calls.borrow().as_slice(), ["a"]);

        // 9 tones: fallbacks kick in.
        let search = FakeSearch::new(vec![
            tones(&[1, 2, 3, 4, 5, 6, 7, 8, 9]),
            tones(&[20, 21]),
        ]);
        let outcome =
            build_pool(&search, &analysis(&["a"], &["x"]), 15, 15).expect("pool");
        assert_eq!(outcome.tones.len(), 11);
        assert_eq!(search.calls.borrow().as_slice(), ["a", "x"]);
        assert_eq!(outcome.queries[1].phase, QueryPhase::Fallback);
    }

    #[test]
    fn fallbacks_stop_once_pool_target_reached() {
        let search = FakeSearch::new(vec![
            tones(&[1, 2, 3]),
            tones(&[4, 5]),
            tones(&[6, 7]),
        ]);
        let outcome =
            build_pool(&search, &analysis(&["a"], &["x", "y"]), 15, 5).expect("pool");
        assert_eq!(outcome.tones.len(), 5);
        // "y" is never issued: the target was reached after "x".
        assert_eq!(search.calls.borrow().as_slice(), ["a", "x"]);
    }

    #[test]
    fn a_failing_query_aborts_the_build() {
        let mut search = FakeSearch::new(vec![tones(&[1])]);
        search.fail_on = Some("b".to_string());
        let err = build_pool(&search, &analysis(&["a", "b"], &[]), 15, 15)
            .expect_err("must propagate");
        assert!(matches!(
            err,
            PipelineError::ServiceRequestFailed { status: 500, .. }
        ));
    }

    #[test]
    fn empty_everything_yields_an_empty_pool() {
        let search = FakeSearch::new(vec![]);
        let outcome = build_pool(&search, &analysis(&["a"], &["x"]), 15, 15).expect("pool");
        assert!(outcome.tones.is_empty());
        assert_eq!(outcome.queries.len(), 2);
    }
}
