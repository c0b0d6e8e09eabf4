//! Declaration file loading and validation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{AppError, AppResult};
use crate::declare::types::GraphDecl;

/// Reserved suffix for synthesized sub-graph return steps. User step names
/// must not end with it so synthesized names cannot collide.
pub const RETURN_SUFFIX: &str = "-return";

/// Loads declaration documents relative to a declarations directory.
///
/// The compiler holds one loader for the whole expansion so every `call`
/// reference resolves against the same root.
#[derive(Debug, Clone)]
pub struct DeclLoader {
    dir: PathBuf,
}

impl DeclLoader {
    /// Create a loader rooted at the given declarations directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Whether a referenced declaration file exists.
    pub fn exists(&self, file: &str) -> bool {
        self.dir.join(file).is_file()
    }

    /// Load and validate one declaration document.
    pub fn load(&self, file: &str) -> AppResult<GraphDecl> {
        load_decl(self.dir.join(file))
    }
}

/// Load and validate a declaration document from a path.
pub fn load_decl(path: impl AsRef<Path>) -> AppResult<GraphDecl> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        AppError::NotFound(format!("declaration {}: {}", path.display(), e))
    })?;

    let decl: GraphDecl =
        serde_yaml::from_str(&text).map_err(|e| AppError::Parse(e.to_string()))?;

    validate_decl(&decl)?;

    Ok(decl)
}

/// Load the shared macro property set (`@{name}` substitutions).
pub fn load_macros(path: impl AsRef<Path>) -> AppResult<HashMap<String, String>> {
    let text = std::fs::read_to_string(path.as_ref())?;
    serde_yaml::from_str(&text).map_err(|e| AppError::Parse(e.to_string()))
}

/// Validate a parsed declaration document.
pub fn validate_decl(decl: &GraphDecl) -> AppResult<()> {
    let name_re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$")
        .map_err(|e| AppError::Internal(e.to_string()))?;

    if !name_re.is_match(&decl.graph) {
        return Err(AppError::Validation(format!(
            "Graph name '{}' is not a valid identifier",
            decl.graph
        )));
    }

    let mut param_names = HashSet::new();
    for param in &decl.params {
        if !param_names.insert(param.name.as_str()) {
            return Err(AppError::Validation(format!(
                "Graph '{}': duplicate parameter '{}'",
                decl.graph, param.name
            )));
        }
    }

    let mut step_names = HashSet::new();
    for (idx, step) in decl.steps.iter().enumerate() {
        if !name_re.is_match(&step.step) {
            return Err(AppError::Validation(format!(
                "Graph '{}': step name '{}' is not a valid identifier",
                decl.graph, step.step
            )));
        }
        if step.step.ends_with(RETURN_SUFFIX) {
            return Err(AppError::Validation(format!(
                "Graph '{}': step name '{}' uses the reserved '{}' suffix",
                decl.graph, step.step, RETURN_SUFFIX
            )));
        }
        if !step_names.insert(step.step.as_str()) {
            return Err(AppError::Validation(format!(
                "Graph '{}': duplicate step '{}'",
                decl.graph, step.step
            )));
        }
        if step.run.is_some() && step.call.is_some() {
            return Err(AppError::Validation(format!(
                "Graph '{}': step '{}' declares both 'run' and 'call'",
                decl.graph, step.step
            )));
        }
        if step.global && step.call.is_none() {
            return Err(AppError::Validation(format!(
                "Graph '{}': step '{}' is marked global but is not a sub-graph call",
                decl.graph, step.step
            )));
        }
        if step.global && idx != 0 {
            return Err(AppError::Validation(format!(
                "Graph '{}': global call '{}' must be the first step",
                decl.graph, step.step
            )));
        }
        if step.exclude_if_missing && step.call.is_none() {
            return Err(AppError::Validation(format!(
                "Graph '{}': step '{}' sets exclude_if_missing without 'call'",
                decl.graph, step.step
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl_from(yaml: &str) -> GraphDecl {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_valid_decl() {
        let decl = decl_from(
            r#"
graph: nightly
steps:
  - step: extract
    run: extractor
  - step: load
    run: loader
    after: [extract]
"#,
        );
        assert!(validate_decl(&decl).is_ok());
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let decl = decl_from(
            "graph: g\nsteps:\n  - step: a\n    run: x\n  - step: a\n    run: y\n",
        );
        let err = validate_decl(&decl).unwrap_err();
        assert!(err.to_string().contains("duplicate step 'a'"));
    }

    #[test]
    fn test_reserved_suffix_rejected() {
        let decl = decl_from("graph: g\nsteps:\n  - step: edge-return\n    run: x\n");
        let err = validate_decl(&decl).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_run_and_call_rejected() {
        let decl = decl_from(
            "graph: g\nsteps:\n  - step: a\n    run: x\n    call: sub.yaml\n",
        );
        assert!(validate_decl(&decl).is_err());
    }

    #[test]
    fn test_global_must_be_first() {
        let decl = decl_from(
            r#"
graph: g
steps:
  - step: a
    run: x
  - step: shared
    call: shared.yaml
    global: true
"#,
        );
        let err = validate_decl(&decl).unwrap_err();
        assert!(err.to_string().contains("must be the first step"));
    }

    #[test]
    fn test_global_requires_call() {
        let decl = decl_from("graph: g\nsteps:\n  - step: a\n    run: x\n    global: true\n");
        assert!(validate_decl(&decl).is_err());
    }

    #[test]
    fn test_loader_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("main.yaml"),
            "graph: main\nsteps:\n  - step: a\n    run: x\n",
        )
        .unwrap();

        let loader = DeclLoader::new(dir.path());
        assert!(loader.exists("main.yaml"));
        assert!(!loader.exists("missing.yaml"));

        let decl = loader.load("main.yaml").unwrap();
        assert_eq!(decl.graph, "main");
        assert_eq!(decl.steps.len(), 1);
    }

    #[test]
    fn test_load_macros() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("macros.yaml");
        std::fs::write(&path, "site: fr-par\ncluster: blue\n").unwrap();

        let macros = load_macros(&path).unwrap();
        assert_eq!(macros["site"], "fr-par");
        assert_eq!(macros["cluster"], "blue");
    }
}
