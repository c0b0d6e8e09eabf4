//! Graph compiler: declaration tree to flat execution graph.
//!
//! Expansion walks the declaration documents depth-first in declared order.
//! Each sub-graph call becomes a call/return bracket; the called document's
//! steps are spliced between the two and merged into the enclosing namespace
//! under the call's full name. Global and external dependency edges are
//! resolved after the whole expansion, then excluded steps are pruned and the
//! final shape is ordered and digested.
//!
//! Missing caller parameters are collected per file and reported together at
//! the end of the pass instead of failing one at a time; unresolved `$(var)`
//! and `@{macro}` tokens in step fields are aggregated the same way.

use std::collections::{BTreeMap, HashMap};

use crate::declare::{DeclLoader, GraphDecl, StepDecl, RETURN_SUFFIX};
use crate::error::{AppError, AppResult};
use crate::graph::subst::Subst;
use crate::graph::topo;
use crate::graph::{Graph, StepId};
use crate::template::TemplateRenderer;

/// Compiles declaration documents into one flat graph.
pub struct Compiler<'a> {
    loader: &'a DeclLoader,
    macros: HashMap<String, String>,
    renderer: TemplateRenderer,
    subst: Subst,

    graph: Graph,
    globals: HashMap<String, String>,
    global_root: Option<String>,
    file_stack: Vec<String>,

    missing: BTreeMap<String, Vec<String>>,
    unresolved: Vec<String>,
    pending_global: Vec<(StepId, String)>,
    pending_external: Vec<(StepId, String)>,
    exports: HashMap<String, StepId>,
}

impl<'a> Compiler<'a> {
    /// Create a compiler over a declarations directory and macro set.
    pub fn new(loader: &'a DeclLoader, macros: HashMap<String, String>) -> AppResult<Self> {
        Ok(Self {
            loader,
            macros,
            renderer: TemplateRenderer::new(),
            subst: Subst::new()?,
            graph: Graph::new("", ""),
            globals: HashMap::new(),
            global_root: None,
            file_stack: Vec::new(),
            missing: BTreeMap::new(),
            unresolved: Vec::new(),
            pending_global: Vec::new(),
            pending_external: Vec::new(),
            exports: HashMap::new(),
        })
    }

    /// Compile the root declaration with a parameter environment into a
    /// finalized graph.
    pub fn compile(
        mut self,
        root_file: &str,
        env: &HashMap<String, String>,
    ) -> AppResult<Graph> {
        let decl = self.loader.load(root_file)?;
        self.graph.name = decl.graph.clone();
        self.graph.version = decl.version.clone();

        self.file_stack.push(root_file.to_string());
        self.expand_level(&decl, root_file, "", env, false)?;
        self.file_stack.pop();

        self.fail_on_collected()?;

        topo::verify_acyclic(&self.graph)?;

        self.resolve_global_deps()?;
        self.resolve_external_deps()?;

        // Late-resolved edges are the only ones that can close a loop across
        // levels, so the order check runs again.
        topo::verify_acyclic(&self.graph)?;

        let mut graph = self.graph;
        graph.prune_excluded();
        graph.finalize()?;

        tracing::info!(
            workflow = %graph.name,
            version = %graph.version,
            steps = graph.len(),
            roots = graph.roots.len(),
            leaves = graph.leaves.len(),
            "Graph compiled"
        );

        Ok(graph)
    }

    /// Expand one declaration level. Returns the level's root and leaf step
    /// ids so a calling bracket can splice them in.
    fn expand_level(
        &mut self,
        decl: &GraphDecl,
        file: &str,
        path: &str,
        caller_params: &HashMap<String, String>,
        in_global: bool,
    ) -> AppResult<(Vec<StepId>, Vec<StepId>)> {
        let params = self.resolve_params(decl, file, path, caller_params);

        let mut created: Vec<StepId> = Vec::new();
        let mut link_targets: HashMap<String, StepId> = HashMap::new();

        // The designated global sub-graph is expanded before this level's
        // constants resolve so its published constants are visible to every
        // later node. Its own fields see caller parameters only.
        let mut index = 0;
        if let Some(first) = decl.steps.first() {
            if first.global {
                if !path.is_empty() {
                    return Err(AppError::Compile(format!(
                        "step '{}': a global call is only allowed at the root level",
                        first.step
                    )));
                }
                if self.global_root.is_some() {
                    return Err(AppError::Compile(format!(
                        "step '{}': a second global call is not allowed",
                        first.step
                    )));
                }
                let mut env = self.globals.clone();
                env.extend(params.clone());
                self.process_step(
                    first,
                    decl,
                    path,
                    &env,
                    in_global,
                    &mut created,
                    &mut link_targets,
                )?;
                index = 1;
            }
        }

        let constants = self.resolve_constants(decl, in_global, &params)?;

        let mut env = self.globals.clone();
        env.extend(constants);
        env.extend(params);

        for d in &decl.steps[index..] {
            if d.global {
                return Err(AppError::Compile(format!(
                    "step '{}': a global call must be the first step of the root level",
                    d.step
                )));
            }
            self.process_step(d, decl, path, &env, in_global, &mut created, &mut link_targets)?;
        }

        let roots = created
            .iter()
            .copied()
            .filter(|&id| self.graph.step(id).parents.is_empty())
            .collect();
        let leaves = created
            .iter()
            .copied()
            .filter(|&id| self.graph.step(id).children.is_empty())
            .collect();

        Ok((roots, leaves))
    }

    /// Bind declared parameters from the caller's values and defaults,
    /// collecting missing ones for the aggregated report.
    fn resolve_params(
        &mut self,
        decl: &GraphDecl,
        file: &str,
        path: &str,
        caller_params: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut params = HashMap::new();
        for p in &decl.params {
            let value = caller_params
                .get(&p.name)
                .cloned()
                .or_else(|| p.default.clone());
            match value {
                Some(v) => {
                    params.insert(p.name.clone(), v);
                }
                None => {
                    let site = if path.is_empty() {
                        "root".to_string()
                    } else {
                        format!("call '{}'", path)
                    };
                    self.missing
                        .entry(file.to_string())
                        .or_default()
                        .push(format!("{}: parameter '{}' not supplied", site, p.name));
                    params.insert(p.name.clone(), String::new());
                }
            }
        }

        for extra in caller_params.keys() {
            if !params.contains_key(extra) {
                tracing::debug!(file = %file, param = %extra, "Caller parameter not declared by sub-graph");
            }
        }

        params
    }

    /// Run the constant substitution pipeline for one level and publish the
    /// result to the global table when inside the global sub-graph.
    fn resolve_constants(
        &mut self,
        decl: &GraphDecl,
        in_global: bool,
        params: &HashMap<String, String>,
    ) -> AppResult<HashMap<String, String>> {
        let mut constants = decl.constants.clone();

        for value in constants.values_mut() {
            *value = self.subst.apply_vars(value, params);
        }
        for value in constants.values_mut() {
            *value = self.subst.apply_vars(value, &self.globals);
        }

        let mut outer = self.globals.clone();
        outer.extend(params.clone());
        self.subst.close_constants(&mut constants, &outer)?;

        if in_global {
            self.globals.extend(constants.clone());
        }

        Ok(constants)
    }

    /// Create one step (and its return bracket for calls), wire its local
    /// dependencies, and recurse into a call's sub-graph.
    #[allow(clippy::too_many_arguments)]
    fn process_step(
        &mut self,
        d: &StepDecl,
        decl: &GraphDecl,
        path: &str,
        env: &HashMap<String, String>,
        in_global: bool,
        created: &mut Vec<StepId>,
        link_targets: &mut HashMap<String, StepId>,
    ) -> AppResult<()> {
        let name = crate::graph::full_name(path, &d.step);
        let mut clean = true;

        let mut params = BTreeMap::new();
        for (k, v) in &d.params {
            let (value, ok) = self.resolve_field(&name, &format!("param '{}'", k), v, env);
            clean &= ok;
            params.insert(k.clone(), value);
        }

        let call_target = d.call.as_ref().map(|c| {
            let (value, ok) = self.resolve_field(&name, "call target", c, env);
            clean &= ok;
            value
        });
        let export = d.export.as_ref().map(|e| {
            let (value, ok) = self.resolve_field(&name, "export name", e, env);
            clean &= ok;
            value
        });
        let include_if = d.include_if.as_ref().map(|p| {
            let (value, ok) = self.resolve_field(&name, "include_if", p, env);
            clean &= ok;
            value
        });
        let exclude_if = d.exclude_if.as_ref().map(|p| {
            let (value, ok) = self.resolve_field(&name, "exclude_if", p, env);
            clean &= ok;
            value
        });
        let skip_if = d.skip_if.as_ref().map(|p| {
            let (value, ok) = self.resolve_field(&name, "skip_if", p, env);
            clean &= ok;
            value
        });

        let mut excluded = false;
        if clean {
            if let Some(pred) = &include_if {
                if !self.renderer.evaluate_condition(pred, env)? {
                    excluded = true;
                }
            }
            if let Some(pred) = &exclude_if {
                if self.renderer.evaluate_condition(pred, env)? {
                    excluded = true;
                }
            }
            if let (Some(target), true) = (&call_target, d.exclude_if_missing) {
                if !self.loader.exists(target) {
                    tracing::info!(step = %name, file = %target, "Excluding call: declaration file absent");
                    excluded = true;
                }
            }
        }

        let id = self.graph.add(path, &d.step)?;
        {
            let step = self.graph.step_mut(id);
            step.params = params;
            step.invoker = d.run.clone();
            step.load_tags = d.load_tags.clone();
            step.fail_tags = d.fail_tags.clone();
            step.is_call = d.is_call();
            step.is_global = in_global;
            step.export = export.clone();
            step.excluded = excluded;
            step.skip_if = skip_if;
        }

        for dep in &d.after {
            match link_targets.get(dep) {
                Some(&target) => self.graph.link(target, id),
                None => {
                    return Err(AppError::Compile(format!(
                        "step '{}': dependency '{}' does not name an earlier step of graph '{}'",
                        name, dep, decl.graph
                    )))
                }
            }
        }

        created.push(id);
        let mut tail = id;

        if d.is_call() {
            let ret_id = self.graph.add(path, &format!("{}{}", d.step, RETURN_SUFFIX))?;
            {
                let ret = self.graph.step_mut(ret_id);
                ret.is_return = true;
                ret.is_global = in_global;
                ret.excluded = excluded;
            }
            self.graph.link(id, ret_id);
            self.graph.step_mut(id).return_id = Some(ret_id);
            created.push(ret_id);
            tail = ret_id;
        }
        link_targets.insert(d.step.clone(), tail);

        if let Some(exp) = export {
            if self.exports.insert(exp.clone(), tail).is_some() {
                return Err(AppError::Compile(format!(
                    "step '{}': export name '{}' already used",
                    name, exp
                )));
            }
        }

        for g in &d.global_after {
            self.pending_global.push((id, g.clone()));
        }
        for x in &d.external_after {
            self.pending_external.push((id, x.clone()));
        }

        if let Some(target) = call_target {
            if !excluded && clean {
                self.expand_call(d, &name, id, &target, in_global)?;
            }
        }

        Ok(())
    }

    /// Recurse into a call's declaration file and splice its level between
    /// the call and return steps.
    fn expand_call(
        &mut self,
        d: &StepDecl,
        call_name: &str,
        call_id: StepId,
        target: &str,
        in_global: bool,
    ) -> AppResult<()> {
        if self.file_stack.iter().any(|f| f == target) {
            return Err(AppError::Compile(format!(
                "circular sub-graph reference: {} -> {}",
                self.file_stack.join(" -> "),
                target
            )));
        }

        let sub_decl = self.loader.load(target)?;
        let call_params: HashMap<String, String> = {
            let step = self.graph.step(call_id);
            step.params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        self.file_stack.push(target.to_string());
        let (roots, leaves) = self.expand_level(
            &sub_decl,
            target,
            call_name,
            &call_params,
            in_global || d.global,
        )?;
        self.file_stack.pop();

        let ret_id = self.graph.step(call_id).return_id.unwrap_or(call_id);
        for r in roots {
            self.graph.link(call_id, r);
        }
        for l in leaves {
            self.graph.link(l, ret_id);
        }

        if d.global {
            self.global_root = Some(call_name.to_string());
        }

        Ok(())
    }

    /// Substitute variables then macros into one field; leftover tokens are
    /// recorded for the aggregated compile report.
    fn resolve_field(
        &mut self,
        step: &str,
        field: &str,
        text: &str,
        env: &HashMap<String, String>,
    ) -> (String, bool) {
        let value = self.subst.apply_vars(text, env);
        let value = self.subst.apply_macros(&value, &self.macros);

        let mut clean = true;
        for token in self.subst.scan_vars(&value) {
            clean = false;
            self.unresolved.push(format!(
                "step '{}': unresolved variable '$({})' in {}",
                step, token, field
            ));
        }
        for token in self.subst.scan_macros(&value) {
            clean = false;
            self.unresolved.push(format!(
                "step '{}': unresolved macro '@{{{}}}' in {}",
                step, token, field
            ));
        }

        (value, clean)
    }

    /// Fail with every collected missing-parameter and unresolved-token
    /// finding at once.
    fn fail_on_collected(&self) -> AppResult<()> {
        if self.missing.is_empty() && self.unresolved.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::new();
        for (file, msgs) in &self.missing {
            for msg in msgs {
                lines.push(format!("{}: {}", file, msg));
            }
        }
        lines.extend(self.unresolved.iter().cloned());

        Err(AppError::Compile(format!(
            "declaration errors:\n  {}",
            lines.join("\n  ")
        )))
    }

    /// Resolve global dependency edges: full paths that must land on steps
    /// inside the designated global sub-graph.
    fn resolve_global_deps(&mut self) -> AppResult<()> {
        for (id, gpath) in std::mem::take(&mut self.pending_global) {
            let step_name = self.graph.step(id).name.clone();
            let target = self.graph.id_by_name(&gpath).ok_or_else(|| {
                AppError::Compile(format!(
                    "step '{}': global dependency '{}' not found",
                    step_name, gpath
                ))
            })?;
            if !self.graph.step(target).is_global {
                return Err(AppError::Compile(format!(
                    "step '{}': global dependency '{}' is not inside the global sub-graph",
                    step_name, gpath
                )));
            }
            let from = self.graph.link_from(target);
            self.graph.link(from, id);
        }
        Ok(())
    }

    /// Resolve external dependency edges through the export table.
    fn resolve_external_deps(&mut self) -> AppResult<()> {
        for (id, export) in std::mem::take(&mut self.pending_external) {
            let step_name = self.graph.step(id).name.clone();
            let target = *self.exports.get(&export).ok_or_else(|| {
                AppError::Compile(format!(
                    "step '{}': external dependency '{}' is not exported by any step",
                    step_name, export
                ))
            })?;
            self.graph.link(target, id);
        }
        Ok(())
    }
}
