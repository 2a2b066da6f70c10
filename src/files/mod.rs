// src/files/mod.rs - File and macro execution engine
pub mod code_file;
pub mod macros;
pub mod path;
pub mod print;
pub mod stack;

pub use code_file::CodeFile;
pub use macros::{MacroOutcome, run_macro};
pub use path::{FileDirectory, PathError, PathResolver};
pub use print::{PrintManager, PrintState, run_print};
pub use stack::{ExecutionStacks, StackGuard};

use crate::code::{Code, CodeResult};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("A file is already being printed")]
    AlreadyPrinting,
}

/// Drives a code through interception and the firmware and waits for its result.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, code: Code) -> CodeResult;
}
