//! Execution graph: arena of steps, compiler, ordering, undo.
//!
//! The compiler expands a declaration tree into one flat [`Graph`]. Steps are
//! arena records addressed by integer ids; edges are id lists on each record.
//! Once finalized a graph's structure never changes; only runtime fields are
//! refreshed from the persisted store.

pub mod compile;
pub mod step;
pub mod subst;
pub mod topo;
pub mod undo;

use std::collections::HashMap;

use crate::error::{AppError, AppResult};

pub use compile::Compiler;
pub use step::{full_name, Observed, Step, StepId, StepState, WorkflowState};

/// Flat execution graph.
#[derive(Debug, Clone)]
pub struct Graph {
    /// Workflow name (root declaration's graph name).
    pub name: String,

    /// Declaration version, part of the instance identity.
    pub version: String,

    steps: Vec<Step>,
    by_name: HashMap<String, StepId>,

    /// Steps with no parents, recomputed at finalize.
    pub roots: Vec<StepId>,

    /// Steps with no children, recomputed at finalize.
    pub leaves: Vec<StepId>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            steps: Vec::new(),
            by_name: HashMap::new(),
            roots: Vec::new(),
            leaves: Vec::new(),
        }
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the graph has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Add a step; full names must be unique.
    pub fn add(&mut self, path: &str, base: &str) -> AppResult<StepId> {
        let id = self.steps.len();
        let step = Step::new(id, path, base);
        if self.by_name.contains_key(&step.name) {
            return Err(AppError::Compile(format!(
                "duplicate step name '{}'",
                step.name
            )));
        }
        self.by_name.insert(step.name.clone(), id);
        self.steps.push(step);
        Ok(id)
    }

    /// Borrow a step.
    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id]
    }

    /// Mutably borrow a step.
    pub fn step_mut(&mut self, id: StepId) -> &mut Step {
        &mut self.steps[id]
    }

    /// Look up a step id by full name.
    pub fn id_by_name(&self, name: &str) -> Option<StepId> {
        self.by_name.get(name).copied()
    }

    /// Look up a step by full name.
    pub fn step_by_name(&self, name: &str) -> Option<&Step> {
        self.id_by_name(name).map(|id| self.step(id))
    }

    /// Iterate all steps in arena order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    /// Iterate all steps mutably.
    pub fn steps_mut(&mut self) -> impl Iterator<Item = &mut Step> {
        self.steps.iter_mut()
    }

    /// Add a parent -> child edge; duplicate edges collapse.
    pub fn link(&mut self, parent: StepId, child: StepId) {
        if parent == child {
            return;
        }
        if !self.steps[parent].children.contains(&child) {
            self.steps[parent].children.push(child);
        }
        if !self.steps[child].parents.contains(&parent) {
            self.steps[child].parents.push(parent);
        }
    }

    /// The id dependency edges should attach to: a call's return step stands
    /// in for the call, so dependents wait for the whole sub-graph.
    pub fn link_from(&self, id: StepId) -> StepId {
        self.steps[id].return_id.unwrap_or(id)
    }

    /// Recompute root and leaf sets from the current edges.
    pub fn recompute_roots_leaves(&mut self) {
        self.roots = self
            .steps
            .iter()
            .filter(|s| s.parents.is_empty())
            .map(|s| s.id)
            .collect();
        self.leaves = self
            .steps
            .iter()
            .filter(|s| s.children.is_empty())
            .map(|s| s.id)
            .collect();
    }

    /// Remove excluded steps, re-linking each one's parents directly to its
    /// children so the graph stays connected, then compact the arena.
    pub fn prune_excluded(&mut self) {
        let excluded: Vec<StepId> = self
            .steps
            .iter()
            .filter(|s| s.excluded)
            .map(|s| s.id)
            .collect();

        for id in excluded {
            let parents = self.steps[id].parents.clone();
            let children = self.steps[id].children.clone();
            for &p in &parents {
                for &c in &children {
                    self.link(p, c);
                }
            }
            for p in parents {
                self.steps[p].children.retain(|&c| c != id);
            }
            for c in children {
                self.steps[c].parents.retain(|&p| p != id);
            }
            self.steps[id].parents.clear();
            self.steps[id].children.clear();
        }

        self.compact();
    }

    /// Rebuild the arena without excluded steps, remapping ids.
    fn compact(&mut self) {
        let mut remap: HashMap<StepId, StepId> = HashMap::new();
        let mut next = 0;
        for step in &self.steps {
            if !step.excluded {
                remap.insert(step.id, next);
                next += 1;
            }
        }

        let old = std::mem::take(&mut self.steps);
        self.by_name.clear();

        for mut step in old.into_iter().filter(|s| !s.excluded) {
            step.id = remap[&step.id];
            step.parents = step.parents.iter().map(|p| remap[p]).collect();
            step.children = step.children.iter().map(|c| remap[c]).collect();
            step.return_id = step.return_id.and_then(|r| remap.get(&r).copied());
            self.by_name.insert(step.name.clone(), step.id);
            self.steps.push(step);
        }

        self.recompute_roots_leaves();
    }

    /// Fix the final shape: root/leaf sets, sorted parent-name lists, and
    /// depth-first order. Fails if the edge set has a cycle.
    pub fn finalize(&mut self) -> AppResult<()> {
        self.recompute_roots_leaves();

        let names: Vec<Vec<String>> = self
            .steps
            .iter()
            .map(|s| {
                let mut depends: Vec<String> = s
                    .parents
                    .iter()
                    .map(|&p| self.steps[p].name.clone())
                    .collect();
                depends.sort();
                depends
            })
            .collect();
        for (step, depends) in self.steps.iter_mut().zip(names) {
            step.depends = depends;
        }

        topo::assign_dfs_order(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked_graph() -> Graph {
        // a -> b -> d, a -> c -> d
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
    fn test_duplicate_name_rejected() {
        let mut g = Graph::new("t", "1");
        g.add("", "a").unwrap();
        assert!(g.add("", "a").is_err());
    }

    #[test]
    fn test_link_dedup() {
        let mut g = Graph::new("t", "1");
        let a = g.add("", "a").unwrap();
        let b = g.add("", "b").unwrap();
        g.link(a, b);
        g.link(a, b);
        assert_eq!(g.step(a).children, vec![b]);
        assert_eq!(g.step(b).parents, vec![a]);
    }

    #[test]
    fn test_roots_leaves() {
        let mut g = linked_graph();
        g.recompute_roots_leaves();
        assert_eq!(g.roots, vec![0]);
        assert_eq!(g.leaves, vec![3]);
    }

    #[test]
    fn test_prune_relinks_through() {
        let mut g = linked_graph();
        let b = g.id_by_name("b").unwrap();
        g.step_mut(b).excluded = true;
        g.prune_excluded();

        assert_eq!(g.len(), 3);
        assert!(g.id_by_name("b").is_none());

        let a = g.step_by_name("a").unwrap();
        let d = g.step_by_name("d").unwrap();
        // a now reaches d both directly (through pruned b) and via c
        assert!(a.children.contains(&d.id));
        assert!(d.parents.contains(&a.id));
    }

    #[test]
    fn test_prune_chain_of_excluded() {
        // a -> b -> c with both b and c excluded leaves a alone
        let mut g = Graph::new("t", "1");
        let a = g.add("", "a").unwrap();
        let b = g.add("", "b").unwrap();
        let c = g.add("", "c").unwrap();
        g.link(a, b);
        g.link(b, c);
        g.step_mut(b).excluded = true;
        g.step_mut(c).excluded = true;
        g.prune_excluded();

        assert_eq!(g.len(), 1);
        assert!(g.step(a).children.is_empty());
    }

    #[test]
    fn test_finalize_assigns_depends() {
        let mut g = linked_graph();
        g.finalize().unwrap();
        let d = g.step_by_name("d").unwrap();
        assert_eq!(d.depends, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(d.depends_text(), "b,c");
    }
}
