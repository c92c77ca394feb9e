//! One generation session: prompt, write, validate, and regenerate until stable or out of budget.

use super::{Engine, ManagedFunction};
use crate::declaration::TestFunction;
use crate::error::{CodespeakError, Result};
use crate::execute::{ExecutionOutcome, Invocation};
use crate::llm::{parse, prompts, Conversation};
use crate::store::FunctionMetadata;
use crate::testing::CrashReport;
use serde_json::Value;

/// Retry counters for one session. They start at zero for every generation request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationState {
    pub num_code_versions: u32,
    pub num_test_versions: u32,
    pub num_bad_formatting_versions: u32,
}

enum Execution {
    Skipped,
    Returned(Value),
    Failed(String),
}

enum TestAlignment {
    Passed,
    Failed(TestFunction, CrashReport),
}

pub(super) struct GenerationSession<'a> {
    engine: &'a Engine,
    function: &'a ManagedFunction,
    invocation: Option<&'a Invocation>,
    conversation: Conversation,
    state: IterationState,
}

impl<'a> GenerationSession<'a> {
    pub(super) fn new(
        engine: &'a Engine,
        function: &'a ManagedFunction,
        invocation: Option<&'a Invocation>,
    ) -> Self {
        Self {
            engine,
            function,
            invocation,
            conversation: Conversation::new(),
            state: IterationState::default(),
        }
    }

    fn qualname(&self) -> &str {
        &self.function.declaration.qualname
    }

    pub(super) async fn run(mut self) -> Result<Option<Value>> {
        let mut source = self.generate_source().await?;
        loop {
            let mut metadata = self.write_version(&source)?;

            let value = match self.align_execution(&mut metadata)? {
                Execution::Failed(exception) => {
                    source = self.regenerate_after_execution_failure(&exception).await?;
                    continue;
                }
                Execution::Returned(value) => Some(value),
                Execution::Skipped => None,
            };

            match self.align_tests()? {
                TestAlignment::Passed => {}
                TestAlignment::Failed(test, crash) => {
                    source = self.regenerate_after_test_failure(&test, &crash).await?;
                    continue;
                }
            }
            if self.function.has_tests() {
                metadata.did_pass_tests = true;
                metadata.touch();
                self.engine.store.write_metadata(&self.function.paths, &metadata)?;
            }

            tracing::info!(
                qualname = %self.qualname(),
                code_versions = self.state.num_code_versions,
                test_versions = self.state.num_test_versions,
                "generated logic is stable"
            );
            return Ok(value);
        }
    }

    /// Persist a new version with unvalidated metadata before anything runs it.
    fn write_version(&self, source: &str) -> Result<FunctionMetadata> {
        let store = &self.engine.store;
        let paths = &self.function.paths;
        store.write_logic(paths, source)?;
        let metadata = FunctionMetadata::fresh(
            self.function.digest.clone(),
            &self.function.declaration.source,
            self.invocation.is_some(),
            self.function.has_tests(),
        );
        store.write_metadata(paths, &metadata)?;
        Ok(metadata)
    }

    fn align_execution(&self, metadata: &mut FunctionMetadata) -> Result<Execution> {
        let Some(invocation) = self.invocation else {
            return Ok(Execution::Skipped);
        };
        let outcome = self.engine.runner.load_and_call(
            &self.function.paths.logic,
            &self.function.declaration.name,
            invocation,
        );
        let value = match outcome {
            Ok(ExecutionOutcome::Returned(value)) => value,
            Ok(ExecutionOutcome::Intentional(inner)) => {
                metadata.did_execute = true;
                metadata.touch();
                self.engine.store.write_metadata(&self.function.paths, metadata)?;
                tracing::info!(
                    qualname = %self.qualname(),
                    exception = %inner,
                    "generated logic raised an intentional exception"
                );
                return Err(CodespeakError::Intentional(inner));
            }
            Ok(ExecutionOutcome::Raised(exc)) => return Ok(Execution::Failed(exc.report())),
            Err(err) if err.is_artifact_defect() => return Ok(Execution::Failed(err.to_string())),
            Err(err) => return Err(err),
        };
        metadata.did_execute = true;
        metadata.touch();
        self.engine.store.write_metadata(&self.function.paths, metadata)?;
        Ok(Execution::Returned(value))
    }

    fn align_tests(&self) -> Result<TestAlignment> {
        let candidate = self.function.candidate();
        for test in self.function.tests() {
            let report = self.engine.harness.run(test, &candidate)?;
            if report.passed() {
                continue;
            }
            if report.exit_status.is_abnormal() {
                return Err(CodespeakError::AbnormalTestExit(report.exit_status));
            }
            let crash = report.single_crash()?.clone();
            return Ok(TestAlignment::Failed(test.clone(), crash));
        }
        Ok(TestAlignment::Passed)
    }

    async fn generate_source(&mut self) -> Result<String> {
        let declaration = &self.function.declaration;
        let prompt = prompts::generation_prompt(
            &declaration.as_incomplete_file(),
            &declaration.custom_types_json()?,
            declaration.goal(),
        );
        self.ask(prompt).await
    }

    async fn regenerate_after_execution_failure(&mut self, exception: &str) -> Result<String> {
        if self.state.num_code_versions >= self.engine.config.max_code_versions {
            return Err(CodespeakError::ExecutionExhausted {
                qualname: self.qualname().to_string(),
            });
        }
        self.state.num_code_versions += 1;
        tracing::info!(
            qualname = %self.qualname(),
            attempt = self.state.num_code_versions,
            trigger = "execution",
            "regenerating"
        );
        self.ask(prompts::execution_correction(exception)).await
    }

    async fn regenerate_after_test_failure(
        &mut self,
        test: &TestFunction,
        crash: &CrashReport,
    ) -> Result<String> {
        if self.state.num_test_versions >= self.engine.config.max_test_versions {
            return Err(CodespeakError::TestsExhausted {
                qualname: self.qualname().to_string(),
            });
        }
        self.state.num_test_versions += 1;
        tracing::info!(
            qualname = %self.qualname(),
            attempt = self.state.num_test_versions,
            trigger = "tests",
            test = %test.node_id(),
            "regenerating"
        );
        self.ask(prompts::test_correction(&test.source, crash)).await
    }

    /// Send `message` and keep asking for a fenced reply within the formatting budget.
    async fn ask(&mut self, message: String) -> Result<String> {
        let mut message = message;
        loop {
            if self.engine.config.verbose {
                tracing::debug!(qualname = %self.qualname(), "prompt:\n{}", message);
            }
            let reply = self
                .conversation
                .send(self.engine.model.as_ref(), message)
                .await?;
            if let Some(code) = parse::extract_python(&reply) {
                if parse::has_unwrapped_raise(&code) {
                    tracing::warn!(
                        qualname = %self.qualname(),
                        "possible manual exception: generated code raises without InferredException"
                    );
                }
                return Ok(code);
            }

            if self.state.num_bad_formatting_versions >= self.engine.config.max_bad_formatting_versions {
                return Err(CodespeakError::FormattingExhausted);
            }
            self.state.num_bad_formatting_versions += 1;
            tracing::info!(
                qualname = %self.qualname(),
                attempt = self.state.num_bad_formatting_versions,
                trigger = "formatting",
                "regenerating"
            );
            message = prompts::FORMATTING_CORRECTION.to_string();
        }
    }
}
