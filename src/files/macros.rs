// src/files/macros.rs - Nested macro files
use super::{CodeExecutor, CodeFile, FileError, StackGuard};
use crate::code::CodeResult;
use futures_util::StreamExt;
use std::path::Path;

#[derive(Debug, Default)]
pub struct MacroOutcome {
    /// Messages of every code of the macro, in execution order.
    pub result: CodeResult,
    pub aborted: bool,
}

impl MacroOutcome {
    /// Whether the firmware has to be told the macro failed.
    pub fn is_error(&self) -> bool {
        self.aborted || !self.result.is_successful()
    }
}

/// Run a macro file inside the stack frame `frame`. Every code is flagged as a
/// macro code so it runs ahead of the codes queued on the channel. The first
/// failing code ends the macro. The frame is popped on every exit path.
pub async fn run_macro(executor: &dyn CodeExecutor, frame: StackGuard, path: &Path) -> Result<MacroOutcome, FileError> {
    let channel = frame.channel();
    let file = CodeFile::open(path, channel).await?.with_abort(frame.abort_handle());
    let abort = file.abort_handle();
    tracing::info!("Running macro {} on {}", path.display(), channel);

    let mut outcome = MacroOutcome::default();
    let codes = file.into_codes();
    futures_util::pin_mut!(codes);
    while let Some(code) = codes.next().await {
        let mut code = code?;
        code.flags.is_from_macro = true;
        let result = executor.execute(code).await;
        let failed = !result.is_successful();
        for message in result.messages() {
            outcome.result.push(message.message_type, message.content.clone());
        }
        if failed {
            tracing::warn!("Macro {} stopped after an error", path.display());
            break;
        }
    }
    outcome.aborted = abort.is_aborted();
    frame.pop();

    if outcome.aborted {
        tracing::info!("Macro {} aborted", path.display());
    } else {
        tracing::info!("Finished macro {}", path.display());
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Code, CodeChannel};
    use crate::files::ExecutionStacks;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recorder {
        stacks: ExecutionStacks,
        seen: Mutex<Vec<(String, u8, bool)>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl CodeExecutor for Recorder {
        async fn execute(&self, code: Code) -> CodeResult {
            let text = code.to_string();
            self.seen.lock().unwrap().push((text.clone(), self.stacks.depth(code.channel), code.flags.is_from_macro));
            if self.fail_on == Some(text.as_str()) {
                return CodeResult::error("failed");
            }
            CodeResult::new()
        }
    }

    #[tokio::test]
    async fn test_macro_runs_inside_its_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("home.g");
        std::fs::write(&path, "G91\nG1 Z5\nG90\n").unwrap();

        let stacks = ExecutionStacks::new();
        let recorder = Recorder { stacks: stacks.clone(), seen: Mutex::default(), fail_on: None };
        let frame = stacks.push(CodeChannel::Http, "home.g", None);
        let outcome = run_macro(&recorder, frame, &path).await.unwrap();

        assert!(!outcome.is_error());
        assert_eq!(stacks.depth(CodeChannel::Http), 0);
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(_, depth, from_macro)| *depth == 1 && *from_macro));
    }

    #[tokio::test]
    async fn test_failing_code_ends_macro() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.g");
        std::fs::write(&path, "M1\nM2\nM3\n").unwrap();

        let stacks = ExecutionStacks::new();
        let recorder = Recorder { stacks: stacks.clone(), seen: Mutex::default(), fail_on: Some("M2") };
        let frame = stacks.push(CodeChannel::Trigger, "bad.g", None);
        let outcome = run_macro(&recorder, frame, &path).await.unwrap();

        assert!(outcome.is_error());
        assert!(!outcome.aborted);
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
        assert_eq!(stacks.depth(CodeChannel::Trigger), 0);
    }

    #[tokio::test]
    async fn test_missing_macro_releases_frame() {
        let dir = tempfile::tempdir().unwrap();
        let stacks = ExecutionStacks::new();
        let recorder = Recorder { stacks: stacks.clone(), seen: Mutex::default(), fail_on: None };
        let frame = stacks.push(CodeChannel::Aux, "missing.g", None);
        assert!(run_macro(&recorder, frame, &dir.path().join("missing.g")).await.is_err());
        assert_eq!(stacks.depth(CodeChannel::Aux), 0);
    }
}
