//! # specql-compiler
//!
//! Compiles SpecQL entity actions into transactional PL/pgSQL functions.
//!
//! - **Pattern Expander** - State machine, multi-entity and batch templates into steps
//! - **Step Compilers** - One compiler per step kind, producing typed ops
//! - **Orchestrator** - Permission guard, current-row prologue, impact metadata
//! - **PL/pgSQL Renderer** - Core function, input type and `app.` wrapper per action
//! - **Plan Executor** - Runs compiled plans against an in-memory store
//!
//! ## Example
//!
//! ```rust,ignore
//! use specql_compiler::{CallContext, FunctionGenerator, MemoryStore, Vm};
//!
//! let output = FunctionGenerator::new(&catalog).generate()?;
//! std::fs::write("actions.sql", output.to_sql())?;
//!
//! let plans = output.plan_set();
//! let mut store = MemoryStore::from_catalog(&catalog);
//! let result = Vm::new(&plans).execute(&mut store, "app.create_contact", ctx, payload)?;
//! ```

pub mod canonical_log;
pub mod composite;
pub mod error;
pub mod expression;
pub mod generator;
pub mod impact;
pub mod ir;
pub mod mutation;
pub mod orchestrator;
pub mod patterns;
pub mod plpgsql;
pub mod scope;
pub mod steps;
pub mod store;
pub mod trinity;
pub mod vm;

pub use error::{CompileError, CompileErrors, ErrorKind, StepPath};
pub use generator::{FunctionGenerator, GeneratedFile, GenerationOutput, GeneratorConfig};
pub use impact::ImpactMetadata;
pub use mutation::{MutationResult, MutationStatus};
pub use orchestrator::{compile_action, ActionPlan, CompileOptions, MutationDescriptor};
pub use store::MemoryStore;
pub use vm::{CallContext, PlanSet, Vm, VmError};
