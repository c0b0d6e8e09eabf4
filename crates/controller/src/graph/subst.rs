//! Variable and macro substitution.
//!
//! Two token syntaxes: `$(name)` draws from the resolved environment of
//! global constants, local constants, and caller parameters; `@{name}` draws
//! from the shared macro property set in a separate pass. Unknown tokens are
//! left in place so the compiler can collect every unresolved name before
//! failing.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{AppError, AppResult};

/// Substitution passes exceeding this many rounds indicate a reference cycle.
const MAX_PASSES: usize = 16;

/// Compiled token patterns shared across one compile run.
pub struct Subst {
    vars: Regex,
    macros: Regex,
}

impl Subst {
    pub fn new() -> AppResult<Self> {
        Ok(Self {
            vars: Regex::new(r"\$\(([A-Za-z_][A-Za-z0-9_]*)\)")
                .map_err(|e| AppError::Internal(e.to_string()))?,
            macros: Regex::new(r"@\{([A-Za-z_][A-Za-z0-9_]*)\}")
                .map_err(|e| AppError::Internal(e.to_string()))?,
        })
    }

    /// Replace `$(name)` tokens with values from the environment; unknown
    /// names stay in place.
    pub fn apply_vars(&self, input: &str, env: &HashMap<String, String>) -> String {
        self.vars
            .replace_all(input, |caps: &regex::Captures| {
                env.get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Replace `@{name}` tokens with values from the macro set; unknown
    /// names stay in place.
    pub fn apply_macros(&self, input: &str, macros: &HashMap<String, String>) -> String {
        self.macros
            .replace_all(input, |caps: &regex::Captures| {
                macros
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Names of `$(name)` tokens still present in a string.
    pub fn scan_vars(&self, input: &str) -> Vec<String> {
        self.vars
            .captures_iter(input)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Names of `@{name}` tokens still present in a string.
    pub fn scan_macros(&self, input: &str) -> Vec<String> {
        self.macros
            .captures_iter(input)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Resolve constants against themselves and the outer environment until
    /// nothing changes. A defined name still unresolved after the fixpoint
    /// means the definitions form a cycle.
    pub fn close_constants(
        &self,
        constants: &mut HashMap<String, String>,
        outer: &HashMap<String, String>,
    ) -> AppResult<()> {
        for _ in 0..MAX_PASSES {
            let mut env = outer.clone();
            env.extend(constants.clone());

            let mut changed = false;
            for value in constants.values_mut() {
                let next = self.apply_vars(value, &env);
                if next != *value {
                    *value = next;
                    changed = true;
                }
            }
            if !changed {
                // Defined names surviving the fixpoint form a reference cycle.
                for (name, value) in constants.iter() {
                    for token in self.scan_vars(value) {
                        if constants.contains_key(&token) || outer.contains_key(&token) {
                            return Err(AppError::Compile(format!(
                                "circular constant reference: '{}' still depends on '{}'",
                                name, token
                            )));
                        }
                    }
                }
                return Ok(());
            }
        }

        Err(AppError::Compile(
            "circular constant reference: substitution did not settle".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_apply_vars() {
        let subst = Subst::new().unwrap();
        let e = env(&[("region", "eu-west"), ("depth", "3")]);
        assert_eq!(
            subst.apply_vars("/data/$(region)/d$(depth)", &e),
            "/data/eu-west/d3"
        );
    }

    #[test]
    fn test_unknown_var_left_in_place() {
        let subst = Subst::new().unwrap();
        let e = env(&[("region", "eu-west")]);
        assert_eq!(subst.apply_vars("$(region)/$(missing)", &e), "eu-west/$(missing)");
        assert_eq!(subst.scan_vars("eu-west/$(missing)"), vec!["missing"]);
    }

    #[test]
    fn test_apply_macros_distinct_syntax() {
        let subst = Subst::new().unwrap();
        let m = env(&[("site", "fr-par")]);
        let e = env(&[("site", "WRONG")]);
        let once = subst.apply_vars("@{site}/$(site)", &e);
        assert_eq!(once, "@{site}/WRONG");
        assert_eq!(subst.apply_macros(&once, &m), "fr-par/WRONG");
    }

    #[test]
    fn test_close_constants_chain() {
        let subst = Subst::new().unwrap();
        let mut constants = env(&[
            ("leaf", "ok"),
            ("mid", "$(leaf)"),
            ("out", "/x/$(mid)"),
        ]);
        subst.close_constants(&mut constants, &HashMap::new()).unwrap();
        assert_eq!(constants["out"], "/x/ok");
    }

    #[test]
    fn test_close_constants_uses_outer() {
        let subst = Subst::new().unwrap();
        let outer = env(&[("region", "eu-west")]);
        let mut constants = env(&[("out_dir", "/data/$(region)")]);
        subst.close_constants(&mut constants, &outer).unwrap();
        assert_eq!(constants["out_dir"], "/data/eu-west");
    }

    #[test]
    fn test_close_constants_cycle_detected() {
        let subst = Subst::new().unwrap();
        let mut constants = env(&[("a", "$(b)"), ("b", "$(a)")]);
        let err = subst
            .close_constants(&mut constants, &HashMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("circular constant reference"));
    }

    #[test]
    fn test_close_constants_self_reference() {
        let subst = Subst::new().unwrap();
        let mut constants = env(&[("a", "$(a)")]);
        assert!(subst
            .close_constants(&mut constants, &HashMap::new())
            .is_err());
    }

    #[test]
    fn test_undefined_token_tolerated_in_constants() {
        // Unknown names are flagged only where they end up used.
        let subst = Subst::new().unwrap();
        let mut constants = env(&[("a", "$(nowhere)")]);
        assert!(subst
            .close_constants(&mut constants, &HashMap::new())
            .is_ok());
        assert_eq!(constants["a"], "$(nowhere)");
    }
}
