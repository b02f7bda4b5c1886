// llm-pyexec: Rust library for executing Python source strings via RustPython VM.

pub mod cache;
pub mod executor;
pub mod modules;
pub mod output;
pub mod pool;
pub mod timeout;
pub mod types;
pub(crate) mod vm;

pub use cache::BytecodeCache;
pub use executor::{execute, maybe_wrap_last_expr};
pub use output::OutputBuffer;
pub use pool::InterpreterPool;
pub use types::{
    ExecutionError, ExecutionResult, ExecutionSettings, DEFAULT_ALLOWED_MODULES,
};
