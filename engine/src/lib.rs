//! The `ScriptEngine` boundary.
//!
//! The full language front-end (grammar, type/lint checker, tree-walking
//! evaluator) is an external collaborator. This crate pins down everything
//! the host runtime needs from it: the AST shape with byte spans, the
//! script value universe, the `Requirements` header, the evaluation state,
//! and the [`ScriptEngine`] trait itself. The bundled [`SurfaceEngine`]
//! implements the trait for the interactive surface (literals, member
//! access, assignment, calls into native verbs, single-expression
//! functions) so the binary and the test suite are self-contained.

pub mod ast;
mod lex;
pub mod parse;
pub mod requirements;
pub mod state;
pub mod surface;
pub mod value;

use std::future::Future;
use std::pin::Pin;

pub use ast::{CtrlKeyword, DeclKeyword, MemberSeg, Module, Node, NodeKind, RecordField};
pub use requirements::{EntityDecl, RequirementDecl};
pub use state::State;
pub use surface::SurfaceEngine;
pub use value::{FuncKind, FuncValue, ListRef, ObjectRef, Value};

use tern_runtime::{Context, RtError};

/// Boxed future returned by verbs and evaluator entry points.
pub type VerbFut<'a> = Pin<Box<dyn Future<Output = Result<Value, RtError>> + Send + 'a>>;

/// A native function registered in the global scope.
///
/// Verbs receive an already-decoded argument vector; per-argument dynamic
/// dispatch is the verb's responsibility and must produce `InvalidArgs`
/// rather than panic on a mismatch.
pub trait Verb: Send + Sync {
    fn name(&self) -> &str;
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a>;
}

/// What the host consumes from the language implementation.
pub trait ScriptEngine: Send + Sync {
    /// Error-tolerant parse: editing-time input yields a module whose
    /// broken regions are `Invalid` nodes rather than a hard error.
    fn parse(&self, source: &str, filename: &str) -> Result<Module, RtError>;

    /// Static checks; rejects modules containing `Invalid` nodes.
    fn check(&self, module: &Module) -> Result<(), RtError>;

    fn eval<'a>(
        &'a self,
        module: &'a Module,
        state: &'a mut State,
        ctx: &'a Context,
    ) -> VerbFut<'a>;

    fn call<'a>(
        &'a self,
        func: &'a FuncValue,
        state: &'a mut State,
        ctx: &'a Context,
        args: Vec<Value>,
    ) -> VerbFut<'a>;
}
