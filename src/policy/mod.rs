//! Policy language front end and the compiled-policy holder.
//!
//! Modules look like:
//!
//! ```text
//! package system.diagnostics
//!
//! default config = {"mode": "off"}
//! config = {"mode": "all"} { input.params.explain == ["full"] }
//! ```

pub mod ast;
pub mod compiler;
pub mod manager;
pub mod parser;

pub use ast::{Expr, ExprKind, Module, Query, Rule};
pub use compiler::{check_query, compile, CompiledPolicy, Diagnostic};
pub use manager::{CompilerManager, PolicyManager, RecompileTrigger};
pub use parser::{parse_module, parse_query, ParseError};
