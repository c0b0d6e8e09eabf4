//! Graph declaration input.
//!
//! Declarations are YAML documents deserialized into an immutable tree of
//! [`GraphDecl`] / [`StepDecl`] nodes. The compiler consumes the tree; it
//! never reads YAML itself.

mod load;
mod types;

pub use load::{load_decl, load_macros, validate_decl, DeclLoader, RETURN_SUFFIX};
pub use types::{GraphDecl, ParamDecl, StepDecl};
