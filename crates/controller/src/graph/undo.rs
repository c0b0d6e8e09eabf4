//! Undo graph derivation.
//!
//! Undo runs completed work backwards: the scope is a chosen root step plus
//! every DONE step below it, with all edges reversed so the deepest work is
//! unwound first and the root last. Call and return brackets swap roles in
//! the reversed graph. Steps that never ran have nothing to unwind and are
//! left out; a RUNNING or FAILED step anywhere below the root blocks undo
//! outright.

use std::collections::{HashMap, HashSet};

use crate::error::{AppError, AppResult};
use crate::graph::{Graph, StepId, StepState};

/// Derive the inverted undo graph for the given root step.
pub fn derive_undo_graph(graph: &Graph, root: &str) -> AppResult<Graph> {
    let root_id = graph
        .id_by_name(root)
        .ok_or_else(|| AppError::NotFound(format!("undo root step '{}'", root)))?;

    let root_step = graph.step(root_id);
    if root_step.state != StepState::Done {
        return Err(AppError::Validation(format!(
            "cannot undo '{}': it is {}, not DONE",
            root, root_step.state
        )));
    }

    let closure = descendants(graph, root_id);
    for &id in &closure {
        let step = graph.step(id);
        match step.state {
            StepState::Running | StepState::Failed => {
                return Err(AppError::Validation(format!(
                    "cannot undo '{}': step '{}' is {}",
                    root, step.name, step.state
                )));
            }
            _ => {}
        }
    }

    let mut retained: Vec<StepId> = vec![root_id];
    retained.extend(
        closure
            .iter()
            .copied()
            .filter(|&id| graph.step(id).state == StepState::Done),
    );
    retained.sort_unstable();
    let keep: HashSet<StepId> = retained.iter().copied().collect();

    let mut undo = Graph::new(&graph.name, &graph.version);
    let mut map: HashMap<StepId, StepId> = HashMap::new();

    for &old_id in &retained {
        let old = graph.step(old_id);
        let new_id = undo.add(&old.path, &old.base)?;
        let new = undo.step_mut(new_id);

        new.params = old.params.clone();
        new.invoker = old.invoker.clone();
        new.load_tags = old.load_tags.clone();
        new.fail_tags = old.fail_tags.clone();
        new.is_call = old.is_return;
        new.is_return = old.is_call;
        new.is_global = old.is_global;
        new.export = old.export.clone();
        new.skip_if = old.skip_if.clone();
        new.db_id = old.db_id;
        new.state = old.state;
        new.undo_state = old.undo_state;
        new.handled = old.handled;
        new.undo_handled = old.undo_handled;
        new.offline = old.offline;
        new.stop_after = old.stop_after;
        new.skipped = old.skipped;
        new.pid = old.pid;
        new.started_at = old.started_at;
        new.ended_at = old.ended_at;
        new.observed = old.observed.clone();

        map.insert(old_id, new_id);
    }

    // Reverse every in-scope edge. The root's upstream edges fall outside
    // the scope, so it ends up the sole leaf of the undo graph.
    for &old_id in &retained {
        for &child in &graph.step(old_id).children {
            if keep.contains(&child) {
                undo.link(map[&child], map[&old_id]);
            }
        }
    }

    // A retained return now leads its bracket; pair it with the old call.
    for &old_id in &retained {
        let old = graph.step(old_id);
        if let Some(ret) = old.return_id {
            if let (Some(&new_call), Some(&new_ret)) = (map.get(&old_id), map.get(&ret)) {
                undo.step_mut(new_ret).return_id = Some(new_call);
            }
        }
    }

    undo.finalize()?;

    tracing::info!(
        root = %root,
        steps = undo.len(),
        "Undo graph derived"
    );

    Ok(undo)
}

/// All steps reachable below `root` through child edges, root excluded.
fn descendants(graph: &Graph, root: StepId) -> Vec<StepId> {
    let mut seen: HashSet<StepId> = HashSet::new();
    let mut stack: Vec<StepId> = graph.step(root).children.clone();

    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            stack.extend(graph.step(id).children.iter().copied());
        }
    }

    let mut out: Vec<StepId> = seen.into_iter().collect();
    out.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(states: &[(&str, StepState)]) -> Graph {
        let mut g = Graph::new("wf", "1");
        let mut prev: Option<StepId> = None;
        for (name, state) in states {
            let id = g.add("", name).unwrap();
            g.step_mut(id).invoker = Some("tool".to_string());
            g.step_mut(id).state = *state;
            if let Some(p) = prev {
                g.link(p, id);
            }
            prev = Some(id);
        }
        g.finalize().unwrap();
        g
    }

    #[test]
    fn test_undo_inverts_chain() {
        let g = chain(&[
            ("a", StepState::Done),
            ("b", StepState::Done),
            ("c", StepState::Done),
        ]);

        let undo = derive_undo_graph(&g, "a").unwrap();
        assert_eq!(undo.len(), 3);

        let a = undo.step_by_name("a").unwrap();
        let c = undo.step_by_name("c").unwrap();
        assert!(a.children.is_empty());
        assert!(c.parents.is_empty());
        assert_eq!(a.depends, vec!["b".to_string()]);
        assert_eq!(undo.roots, vec![c.id]);
        assert_eq!(undo.leaves, vec![a.id]);
    }

    #[test]
    fn test_undo_scope_keeps_root_and_done_only() {
        let g = chain(&[
            ("a", StepState::Done),
            ("b", StepState::Done),
            ("c", StepState::Ready),
        ]);

        let undo = derive_undo_graph(&g, "a").unwrap();
        assert_eq!(undo.len(), 2);
        assert!(undo.step_by_name("c").is_none());
    }

    #[test]
    fn test_running_descendant_blocks_undo() {
        let g = chain(&[
            ("a", StepState::Done),
            ("b", StepState::Running),
            ("c", StepState::Ready),
        ]);

        let err = derive_undo_graph(&g, "a").unwrap_err().to_string();
        assert!(err.contains("'b' is RUNNING"));
    }

    #[test]
    fn test_failed_descendant_blocks_undo() {
        let g = chain(&[
            ("a", StepState::Done),
            ("b", StepState::Done),
            ("c", StepState::Failed),
        ]);

        let err = derive_undo_graph(&g, "a").unwrap_err().to_string();
        assert!(err.contains("'c' is FAILED"));
    }

    #[test]
    fn test_undo_mid_graph_excludes_ancestors() {
        let g = chain(&[
            ("a", StepState::Done),
            ("b", StepState::Done),
            ("c", StepState::Done),
        ]);

        let undo = derive_undo_graph(&g, "b").unwrap();
        assert_eq!(undo.len(), 2);
        assert!(undo.step_by_name("a").is_none());

        let b = undo.step_by_name("b").unwrap();
        assert!(b.children.is_empty());
    }

    #[test]
    fn test_call_return_roles_swap() {
        let mut g = Graph::new("wf", "1");
        let call = g.add("", "stage").unwrap();
        let sub = g.add("stage", "work").unwrap();
        let ret = g.add("", "stage-return").unwrap();
        g.step_mut(call).is_call = true;
        g.step_mut(call).return_id = Some(ret);
        g.step_mut(ret).is_return = true;
        g.step_mut(sub).invoker = Some("tool".to_string());
        g.link(call, sub);
        g.link(sub, ret);
        g.link(call, ret);
        for id in [call, sub, ret] {
            g.step_mut(id).state = StepState::Done;
        }
        g.finalize().unwrap();

        let undo = derive_undo_graph(&g, "stage").unwrap();
        let u_call = undo.step_by_name("stage").unwrap();
        let u_ret = undo.step_by_name("stage-return").unwrap();
        let u_sub = undo.step_by_name("stage.work").unwrap();

        assert!(u_ret.is_call && !u_ret.is_return);
        assert!(u_call.is_return && !u_call.is_call);
        assert_eq!(u_ret.return_id, Some(u_call.id));

        // the bracket unwinds inside-out: return first, call last
        assert_eq!(undo.roots, vec![u_ret.id]);
        assert_eq!(undo.leaves, vec![u_call.id]);
        assert!(u_sub.parents.contains(&u_ret.id));
    }

    #[test]
    fn test_unknown_root_rejected() {
        let g = chain(&[("a", StepState::Done)]);
        assert!(derive_undo_graph(&g, "ghost").is_err());
    }

    #[test]
    fn test_root_must_be_done() {
        let g = chain(&[("a", StepState::Ready), ("b", StepState::Ready)]);
        let err = derive_undo_graph(&g, "a").unwrap_err().to_string();
        assert!(err.contains("not DONE"));
    }
}
