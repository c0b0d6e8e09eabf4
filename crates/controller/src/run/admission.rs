//! Admission control: load and fail throttles.
//!
//! Counts are recomputed from the snapshot every cycle rather than carried
//! across cycles, so externally-caused state changes are always reflected.
//! Within one admission pass the counts are bumped as steps are admitted,
//! keeping a single pass from overshooting a limit.

use std::collections::HashMap;
use std::fmt;

use crate::config::ThrottleConfig;
use crate::graph::{Graph, Step, StepId, StepState};

/// The implicit tag every step carries.
pub const TOTAL_TAG: &str = "total";

/// Split a possibly path-qualified tag into (scope, bare name). A tag
/// "ingest:big-mem" is scoped to the call site "ingest"; a bare tag has an
/// empty scope.
fn split_tag(tag: &str) -> (&str, &str) {
    match tag.split_once(':') {
        Some((scope, name)) => (scope, name),
        None => ("", tag),
    }
}

/// Whether a tag declared on a step applies to it. Unqualified tags always
/// do; qualified tags only when the step sits at or below the qualifying
/// call site, and are ignored above it.
fn tag_applies(step: &Step, tag: &str) -> bool {
    let (scope, _) = split_tag(tag);
    scope.is_empty()
        || step.path == scope
        || (step.path.starts_with(scope) && step.path[scope.len()..].starts_with('.'))
}

/// Per-tag counts of steps in one operative state.
#[derive(Debug, Default)]
pub struct TagCounts {
    by_tag: HashMap<String, i64>,
    by_invoker: HashMap<String, i64>,
    total: i64,
}

impl TagCounts {
    /// Count for one tag (full, possibly qualified, text).
    pub fn tag(&self, tag: &str) -> i64 {
        self.by_tag.get(tag).copied().unwrap_or(0)
    }

    /// Count for one step class.
    pub fn invoker(&self, invoker: &str) -> i64 {
        self.by_invoker.get(invoker).copied().unwrap_or(0)
    }

    /// Count across all steps.
    pub fn total(&self) -> i64 {
        self.total
    }

    /// Account an admitted launch so later candidates in the same pass
    /// see it.
    pub fn record(&mut self, step: &Step) {
        self.total += 1;
        if let Some(invoker) = &step.invoker {
            *self.by_invoker.entry(invoker.clone()).or_insert(0) += 1;
        }
        for tag in &step.load_tags {
            if tag_applies(step, tag) {
                *self.by_tag.entry(tag.clone()).or_insert(0) += 1;
            }
        }
    }
}

fn counts_in_state<'a, F>(graph: &'a Graph, undo: bool, state: StepState, tags_of: F) -> TagCounts
where
    F: Fn(&'a Step) -> &'a [String],
{
    let mut counts = TagCounts::default();
    for step in graph.steps() {
        if step.operative_state(undo) != state {
            continue;
        }
        counts.total += 1;
        if let Some(invoker) = &step.invoker {
            *counts.by_invoker.entry(invoker.clone()).or_insert(0) += 1;
        }
        for tag in tags_of(step) {
            if tag_applies(step, tag) {
                *counts.by_tag.entry(tag.clone()).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Count RUNNING steps by load tag, step class, and in total.
pub fn running_counts(graph: &Graph, undo: bool) -> TagCounts {
    counts_in_state(graph, undo, StepState::Running, |s| &s.load_tags)
}

/// Count FAILED steps by fail tag, step class, and in total.
pub fn failed_counts(graph: &Graph, undo: bool) -> TagCounts {
    counts_in_state(graph, undo, StepState::Failed, |s| &s.fail_tags)
}

/// Why a step was held back this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Held {
    LoadTag { tag: String, count: i64, limit: i64 },
    LoadClass { invoker: String, count: i64, limit: i64 },
    FailTag { tag: String, count: i64, limit: i64 },
    FailClass { invoker: String, count: i64, limit: i64 },
}

impl fmt::Display for Held {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Held::LoadTag { tag, count, limit } => {
                write!(f, "load tag '{}' at {}/{}", tag, count, limit)
            }
            Held::LoadClass { invoker, count, limit } => {
                write!(f, "step class '{}' running {}/{}", invoker, count, limit)
            }
            Held::FailTag { tag, count, limit } => {
                write!(f, "fail tag '{}' at {}/{}", tag, count, limit)
            }
            Held::FailClass { invoker, count, limit } => {
                write!(f, "step class '{}' failed {}/{}", invoker, count, limit)
            }
        }
    }
}

/// Decide whether an ON_DECK step may launch under the current counts.
pub fn admit(
    step: &Step,
    throttle: &ThrottleConfig,
    running: &TagCounts,
    failed: &TagCounts,
) -> Result<(), Held> {
    let limit = throttle.load_limit(TOTAL_TAG);
    if running.total() >= limit {
        return Err(Held::LoadTag {
            tag: TOTAL_TAG.to_string(),
            count: running.total(),
            limit,
        });
    }

    let mut tagged = false;
    for tag in &step.load_tags {
        if !tag_applies(step, tag) {
            continue;
        }
        tagged = true;
        let (_, bare) = split_tag(tag);
        let limit = throttle.load_limit(bare);
        let count = running.tag(tag);
        if count >= limit {
            return Err(Held::LoadTag {
                tag: tag.clone(),
                count,
                limit,
            });
        }
    }
    if !tagged {
        if let Some(invoker) = &step.invoker {
            let limit = throttle.load_limit(invoker);
            let count = running.invoker(invoker);
            if count >= limit {
                return Err(Held::LoadClass {
                    invoker: invoker.clone(),
                    count,
                    limit,
                });
            }
        }
    }

    let limit = throttle.fail_limit(TOTAL_TAG);
    if failed.total() >= limit {
        return Err(Held::FailTag {
            tag: TOTAL_TAG.to_string(),
            count: failed.total(),
            limit,
        });
    }

    let mut tagged = false;
    for tag in &step.fail_tags {
        if !tag_applies(step, tag) {
            continue;
        }
        tagged = true;
        let (_, bare) = split_tag(tag);
        let limit = throttle.fail_limit(bare);
        let count = failed.tag(tag);
        if count >= limit {
            return Err(Held::FailTag {
                tag: tag.clone(),
                count,
                limit,
            });
        }
    }
    if !tagged {
        if let Some(invoker) = &step.invoker {
            let limit = throttle.fail_limit(invoker);
            let count = failed.invoker(invoker);
            if count >= limit {
                return Err(Held::FailClass {
                    invoker: invoker.clone(),
                    count,
                    limit,
                });
            }
        }
    }

    Ok(())
}

/// Whether every parent of a step is operatively DONE and, outside undo,
/// none still holds a stop-after breakpoint.
pub fn parents_satisfied(graph: &Graph, id: StepId, undo: bool) -> bool {
    graph.step(id).parents.iter().all(|&p| {
        let parent = graph.step(p);
        parent.operative_state(undo) == StepState::Done && (undo || !parent.stop_after)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_step(name: &str, invoker: &str, load_tags: &[&str]) -> (Graph, StepId) {
        let mut g = Graph::new("wf", "1");
        let id = g.add("", name).unwrap();
        g.step_mut(id).invoker = Some(invoker.to_string());
        g.step_mut(id).load_tags = load_tags.iter().map(|t| t.to_string()).collect();
        (g, id)
    }

    fn pool_graph(n: usize, tag: &str) -> Graph {
        let mut g = Graph::new("wf", "1");
        for i in 0..n {
            let id = g.add("", &format!("work-{}", i)).unwrap();
            g.step_mut(id).invoker = Some("worker".to_string());
            g.step_mut(id).load_tags = vec![tag.to_string()];
            g.step_mut(id).state = StepState::OnDeck;
        }
        g.finalize().unwrap();
        g
    }

    fn throttle(load: &[(&str, i64)], fail: &[(&str, i64)]) -> ThrottleConfig {
        let mut t = ThrottleConfig::default();
        for (k, v) in load {
            t.load_limits.insert(k.to_string(), *v);
        }
        for (k, v) in fail {
            t.fail_limits.insert(k.to_string(), *v);
        }
        t
    }

    #[test]
    fn test_one_pass_respects_tag_limit() {
        let g = pool_graph(5, "gpu");
        let t = throttle(&[("total", 100), ("gpu", 2)], &[("total", 100)]);

        let mut running = running_counts(&g, false);
        let failed = failed_counts(&g, false);

        let mut admitted = 0;
        for step in g.steps() {
            if admit(step, &t, &running, &failed).is_ok() {
                running.record(step);
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
    }

    #[test]
    fn test_total_limit_counts_everything() {
        let g = pool_graph(5, "gpu");
        let t = throttle(&[("total", 3), ("gpu", 100)], &[("total", 100)]);

        let mut running = running_counts(&g, false);
        let failed = failed_counts(&g, false);

        let mut admitted = 0;
        for step in g.steps() {
            if admit(step, &t, &running, &failed).is_ok() {
                running.record(step);
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_untagged_step_falls_back_to_class_cap() {
        let (g, id) = worker_step("work", "loader", &[]);
        let t = throttle(&[("total", 100), ("loader", 1)], &[("total", 100)]);

        let mut running = TagCounts::default();
        let failed = TagCounts::default();

        let step = g.step(id);
        assert!(admit(step, &t, &running, &failed).is_ok());
        running.record(step);

        let held = admit(step, &t, &running, &failed).unwrap_err();
        assert!(matches!(held, Held::LoadClass { .. }));
    }

    #[test]
    fn test_fail_throttle_blocks_admission() {
        let mut g = Graph::new("wf", "1");
        let failed_id = g.add("", "broken").unwrap();
        g.step_mut(failed_id).invoker = Some("loader".to_string());
        g.step_mut(failed_id).fail_tags = vec!["flaky".to_string()];
        g.step_mut(failed_id).state = StepState::Failed;

        let next = g.add("", "next").unwrap();
        g.step_mut(next).invoker = Some("loader".to_string());
        g.step_mut(next).fail_tags = vec!["flaky".to_string()];
        g.step_mut(next).state = StepState::OnDeck;
        g.finalize().unwrap();

        let t = throttle(&[("total", 100)], &[("total", 100), ("flaky", 1)]);
        let running = running_counts(&g, false);
        let failed = failed_counts(&g, false);

        let held = admit(g.step(next), &t, &running, &failed).unwrap_err();
        assert!(matches!(held, Held::FailTag { .. }));
    }

    #[test]
    fn test_qualified_tag_ignored_outside_scope() {
        let mut g = Graph::new("wf", "1");
        let id = g.add("", "work").unwrap();
        g.step_mut(id).invoker = Some("worker".to_string());
        g.step_mut(id).load_tags = vec!["ingest:gpu".to_string()];
        g.step_mut(id).state = StepState::OnDeck;
        g.finalize().unwrap();

        // the tag is scoped to the "ingest" call site; this step is at the
        // root, so the tag does not bind and the class cap applies instead
        let t = throttle(&[("total", 100), ("gpu", 0), ("worker", 5)], &[("total", 100)]);
        let running = TagCounts::default();
        let failed = TagCounts::default();

        assert!(admit(g.step(id), &t, &running, &failed).is_ok());
    }

    #[test]
    fn test_qualified_tag_binds_inside_scope() {
        let mut g = Graph::new("wf", "1");
        let id = g.add("ingest", "work").unwrap();
        g.step_mut(id).invoker = Some("worker".to_string());
        g.step_mut(id).load_tags = vec!["ingest:gpu".to_string()];
        g.step_mut(id).state = StepState::OnDeck;
        g.finalize().unwrap();

        let t = throttle(&[("total", 100), ("gpu", 0)], &[("total", 100)]);
        let running = TagCounts::default();
        let failed = TagCounts::default();

        let held = admit(g.step(id), &t, &running, &failed).unwrap_err();
        assert!(matches!(held, Held::LoadTag { .. }));
    }

    #[test]
    fn test_parents_must_all_be_done() {
        let mut g = Graph::new("wf", "1");
        let a = g.add("", "a").unwrap();
        let b = g.add("", "b").unwrap();
        let c = g.add("", "c").unwrap();
        for id in [a, b, c] {
            g.step_mut(id).invoker = Some("tool".to_string());
        }
        g.link(a, b);
        g.link(b, c);
        g.finalize().unwrap();

        g.step_mut(a).state = StepState::Done;
        g.step_mut(b).state = StepState::Failed;

        // a failed parent blocks the chain
        assert!(!parents_satisfied(&g, c, false));
        assert!(parents_satisfied(&g, b, false));
    }

    #[test]
    fn test_stop_after_holds_children_back() {
        let mut g = Graph::new("wf", "1");
        let a = g.add("", "a").unwrap();
        let b = g.add("", "b").unwrap();
        g.step_mut(a).invoker = Some("tool".to_string());
        g.step_mut(b).invoker = Some("tool".to_string());
        g.link(a, b);
        g.finalize().unwrap();

        g.step_mut(a).state = StepState::Done;
        g.step_mut(a).stop_after = true;

        assert!(!parents_satisfied(&g, b, false));
        // breakpoints do not apply while undoing
        g.step_mut(a).undo_state = Some(StepState::Done);
        assert!(parents_satisfied(&g, b, true));
    }
}
