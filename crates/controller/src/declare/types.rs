//! Declaration tree types.
//!
//! One YAML document describes one graph level: its parameters, constants,
//! and ordered step declarations. Sub-graphs are separate documents referenced
//! by file name from a calling step.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One graph declaration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDecl {
    /// Graph name.
    pub graph: String,

    /// Declaration version, part of the workflow instance identity.
    #[serde(default = "default_version")]
    pub version: String,

    /// Parameters this graph expects from its caller.
    #[serde(default)]
    pub params: Vec<ParamDecl>,

    /// Constants local to this level, in `$(name)` token form before resolution.
    #[serde(default)]
    pub constants: HashMap<String, String>,

    /// Ordered step declarations. Order matters: dependencies may only point
    /// at earlier steps, and a global call must come first.
    #[serde(default)]
    pub steps: Vec<StepDecl>,
}

fn default_version() -> String {
    "1".to_string()
}

/// A parameter declared by a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDecl {
    /// Parameter name.
    pub name: String,

    /// Default value used when the caller omits the parameter.
    #[serde(default)]
    pub default: Option<String>,
}

/// One step declaration inside a graph level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDecl {
    /// Step base name, unique within the level.
    pub step: String,

    /// Invoker: the worker program class that executes this step.
    /// Absent for sub-graph calls.
    #[serde(default)]
    pub run: Option<String>,

    /// Sub-graph call: declaration file referenced relative to the
    /// declarations directory. Mutually exclusive with `run`.
    #[serde(default)]
    pub call: Option<String>,

    /// Marks the call as the designated global sub-graph. Only valid on the
    /// first step of the root declaration.
    #[serde(default)]
    pub global: bool,

    /// With `call`: exclude this step when the referenced file is absent
    /// instead of failing the compile.
    #[serde(default)]
    pub exclude_if_missing: bool,

    /// Local dependencies: names of steps declared earlier in this level.
    #[serde(default)]
    pub after: Vec<String>,

    /// Global dependencies: full paths of steps inside the global sub-graph,
    /// resolved after expansion.
    #[serde(default)]
    pub global_after: Vec<String>,

    /// External dependencies: export names declared by steps anywhere in the
    /// expanded graph, resolved after expansion.
    #[serde(default)]
    pub external_after: Vec<String>,

    /// Export name making this step addressable by `external_after` edges.
    #[serde(default)]
    pub export: Option<String>,

    /// Step parameters. For a `run` step these become worker flags; for a
    /// `call` step they form the sub-graph's parameter environment.
    #[serde(default)]
    pub params: HashMap<String, String>,

    /// Include predicate: step is excluded when this evaluates false.
    #[serde(default)]
    pub include_if: Option<String>,

    /// Exclude predicate: step is excluded when this evaluates true.
    #[serde(default)]
    pub exclude_if: Option<String>,

    /// Skip marker path handed to the worker; the worker exits successfully
    /// without doing work when the marker exists.
    #[serde(default)]
    pub skip_if: Option<String>,

    /// Load tags for admission throttling of RUNNING steps.
    #[serde(default)]
    pub load_tags: Vec<String>,

    /// Fail tags for admission throttling against FAILED counts.
    #[serde(default)]
    pub fail_tags: Vec<String>,
}

impl StepDecl {
    /// Whether this declaration is a sub-graph call.
    pub fn is_call(&self) -> bool {
        self.call.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_step_yaml() {
        let yaml = "step: extract\nrun: extractor\n";
        let decl: StepDecl = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(decl.step, "extract");
        assert_eq!(decl.run.as_deref(), Some("extractor"));
        assert!(decl.after.is_empty());
        assert!(!decl.is_call());
    }

    #[test]
    fn test_call_step_yaml() {
        let yaml = r#"
step: ingest
call: ingest.yaml
params:
  region: $(region)
after: [extract]
"#;
        let decl: StepDecl = serde_yaml::from_str(yaml).unwrap();
        assert!(decl.is_call());
        assert_eq!(decl.params["region"], "$(region)");
        assert_eq!(decl.after, vec!["extract"]);
    }

    #[test]
    fn test_graph_decl_yaml() {
        let yaml = r#"
graph: nightly
params:
  - name: region
  - name: depth
    default: "3"
constants:
  out_dir: /data/$(region)
steps:
  - step: extract
    run: extractor
  - step: transform
    run: transformer
    after: [extract]
    load_tags: [cpu]
"#;
        let decl: GraphDecl = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(decl.graph, "nightly");
        assert_eq!(decl.params.len(), 2);
        assert_eq!(decl.params[1].default.as_deref(), Some("3"));
        assert_eq!(decl.constants["out_dir"], "/data/$(region)");
        assert_eq!(decl.steps.len(), 2);
        assert_eq!(decl.steps[1].after, vec!["extract"]);
    }
}
