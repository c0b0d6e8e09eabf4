//! Topological ordering and cycle detection.
//!
//! One iterative depth-first traversal serves both checks: it fails on a back
//! edge (reporting the full step path around the cycle) and otherwise yields
//! the stable preorder used as depth-first execution order.

use crate::error::{AppError, AppResult};
use crate::graph::{Graph, StepId};

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Verify the edge set is acyclic.
pub fn verify_acyclic(graph: &Graph) -> AppResult<()> {
    depth_first(graph).map(|_| ())
}

/// Assign depth-first preorder indices to every step.
pub fn assign_dfs_order(graph: &mut Graph) -> AppResult<()> {
    let order = depth_first(graph)?;
    for (idx, id) in order.into_iter().enumerate() {
        graph.step_mut(id).dfs_order = idx as i32;
    }
    Ok(())
}

/// Depth-first preorder over every step, roots first, then any step a root
/// cannot reach (possible only when such steps sit on a cycle, which fails).
fn depth_first(graph: &Graph) -> AppResult<Vec<StepId>> {
    let n = graph.len();
    let mut color = vec![Color::White; n];
    let mut preorder = Vec::with_capacity(n);

    let mut starts: Vec<StepId> = graph
        .steps()
        .filter(|s| s.parents.is_empty())
        .map(|s| s.id)
        .collect();
    starts.extend(graph.steps().map(|s| s.id));

    for start in starts {
        if color[start] != Color::White {
            continue;
        }
        visit(graph, start, &mut color, &mut preorder)?;
    }

    Ok(preorder)
}

/// Iterative visit from one start node. The explicit stack doubles as the
/// path for cycle diagnostics.
fn visit(
    graph: &Graph,
    start: StepId,
    color: &mut [Color],
    preorder: &mut Vec<StepId>,
) -> AppResult<()> {
    let mut stack: Vec<(StepId, usize)> = vec![(start, 0)];
    color[start] = Color::Gray;
    preorder.push(start);

    while let Some(top) = stack.last_mut() {
        let id = top.0;
        let next = top.1;
        let children = &graph.step(id).children;
        if next < children.len() {
            top.1 += 1;
            let child = children[next];
            match color[child] {
                Color::White => {
                    color[child] = Color::Gray;
                    preorder.push(child);
                    stack.push((child, 0));
                }
                Color::Gray => {
                    return Err(cycle_error(graph, &stack, child));
                }
                Color::Black => {}
            }
        } else {
            color[id] = Color::Black;
            stack.pop();
        }
    }

    Ok(())
}

/// Build the cycle diagnostic from the traversal stack: the path from the
/// revisited step back around to itself.
fn cycle_error(graph: &Graph, stack: &[(StepId, usize)], repeat: StepId) -> AppError {
    let from = stack
        .iter()
        .position(|&(id, _)| id == repeat)
        .unwrap_or(0);
    let mut path: Vec<&str> = stack[from..]
        .iter()
        .map(|&(id, _)| graph.step(id).name.as_str())
        .collect();
    path.push(graph.step(repeat).name.as_str());

    AppError::Compile(format!("dependency cycle: {}", path.join(" -> ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Graph {
        let mut g = Graph::new("t", "1");
        let a = g.add("", "a").unwrap();
        let b = g.add("", "b").unwrap();
        let c = g.add("", "c").unwrap();
        let d = g.add("", "d").unwrap();
        g.link(a, b);
        g.link(a, c);
        g.link(b, d);
        g.link(c, d);
        g
    }

    #[test]
    fn test_acyclic_ok() {
        let g = diamond();
        assert!(verify_acyclic(&g).is_ok());
    }

    #[test]
    fn test_dfs_order_preorder() {
        let mut g = diamond();
        assign_dfs_order(&mut g).unwrap();
        assert_eq!(g.step_by_name("a").unwrap().dfs_order, 0);
        assert_eq!(g.step_by_name("b").unwrap().dfs_order, 1);
        assert_eq!(g.step_by_name("d").unwrap().dfs_order, 2);
        assert_eq!(g.step_by_name("c").unwrap().dfs_order, 3);
    }

    #[test]
    fn test_cycle_reports_path() {
        let mut g = Graph::new("t", "1");
        let a = g.add("", "a").unwrap();
        let b = g.add("", "b").unwrap();
        let c = g.add("", "c").unwrap();
        g.link(a, b);
        g.link(b, c);
        g.link(c, a);

        let err = verify_acyclic(&g).unwrap_err().to_string();
        assert!(err.contains("dependency cycle"));
        assert!(err.contains("a -> b -> c -> a"), "got: {}", err);
    }

    #[test]
    fn test_cycle_unreachable_from_roots() {
        // r -> a, plus a detached b <-> c cycle with no root entry
        let mut g = Graph::new("t", "1");
        let r = g.add("", "r").unwrap();
        let a = g.add("", "a").unwrap();
        let b = g.add("", "b").unwrap();
        let c = g.add("", "c").unwrap();
        g.link(r, a);
        g.link(b, c);
        g.link(c, b);

        assert!(verify_acyclic(&g).is_err());
    }

    #[test]
    fn test_self_cycle_via_later_edge() {
        let mut g = diamond();
        let d = g.id_by_name("d").unwrap();
        let a = g.id_by_name("a").unwrap();
        g.link(d, a);
        let err = verify_acyclic(&g).unwrap_err().to_string();
        assert!(err.contains("a -> "));
    }
}
