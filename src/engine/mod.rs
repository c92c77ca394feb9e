//! The inference engine: decide whether cached logic is usable, and if not, generate it.
//!
//! States of one managed function:
//!
//! ```text
//! NO_ARTIFACT -> GENERATING -> EXECUTION_ALIGNMENT -> TEST_ALIGNMENT -> STABLE
//!                    ^                 |                    |
//!                    +-----------------+--------------------+
//! ```
//!
//! Every call re-extracts the declaration, so edits to the stub's docstring, signature or
//! referenced classes are picked up through the digest.

mod session;

pub use session::IterationState;

use crate::config::Config;
use crate::declaration::{FunctionDeclaration, TestFunction};
use crate::digest::{DeclarationDigest, DigestPolicy};
use crate::error::{CodespeakError, Result};
use crate::execute::{CodeRunner, ExecutionOutcome, Invocation, PythonGateway};
use crate::llm::{BoxFuture, ChatMessage, ModelClient, OpenAiClient};
use crate::store::cleanup::{remove_unused_artifacts, SourceIndex};
use crate::store::{ArtifactPaths, ArtifactStore, MetadataLoad};
use crate::testing::{Candidate, PytestHarness, TestHarness};
use crate::types::ProjectResolver;
use serde_json::Value;
use session::GenerationSession;

/// Typed handle for a function whose body is inferred.
#[derive(Debug, Clone)]
pub struct ManagedFunction {
    pub declaration: FunctionDeclaration,
    pub digest: DeclarationDigest,
    pub paths: ArtifactPaths,
    tests: Vec<TestFunction>,
    receiver_bound: bool,
}

impl ManagedFunction {
    pub fn new(
        resolver: &mut ProjectResolver,
        store: &ArtifactStore,
        module: &str,
        qualname: &str,
    ) -> Result<Self> {
        let declaration = FunctionDeclaration::extract(resolver, module, qualname)?;
        let digest = declaration.digest()?;
        let paths = store.paths(&declaration.module, &declaration.qualname);
        Ok(Self {
            declaration,
            digest,
            paths,
            tests: Vec::new(),
            receiver_bound: false,
        })
    }

    /// Attach a test the generated logic must pass.
    pub fn with_test(mut self, test: TestFunction) -> Self {
        self.tests.push(test);
        self
    }

    pub fn tests(&self) -> &[TestFunction] {
        &self.tests
    }

    pub fn has_tests(&self) -> bool {
        !self.tests.is_empty()
    }

    pub fn receiver_bound(&self) -> bool {
        self.receiver_bound
    }

    /// Re-read the declaration from source, keeping a previously bound receiver type.
    pub fn refresh(&mut self, resolver: &mut ProjectResolver) -> Result<()> {
        let mut declaration =
            FunctionDeclaration::extract(resolver, &self.declaration.module, &self.declaration.qualname)?;
        if self.receiver_bound {
            declaration.bind_self_type(resolver)?;
        }
        self.digest = declaration.digest()?;
        self.declaration = declaration;
        Ok(())
    }

    /// Annotate `self` with the owning class the first time the method is called on an instance.
    pub fn bind_receiver(&mut self, resolver: &mut ProjectResolver) -> Result<()> {
        if self.receiver_bound {
            return Ok(());
        }
        if self.declaration.bind_self_type(resolver)? {
            self.digest = self.declaration.digest()?;
        }
        self.receiver_bound = true;
        Ok(())
    }

    fn candidate(&self) -> Candidate {
        Candidate::new(&self.paths.logic, &self.declaration.name)
            .declared_in(&self.declaration.module, &self.declaration.qualname)
    }
}

/// Whether the artifact on disk can be reused for this call.
pub fn require_new_codegen(
    metadata: &MetadataLoad,
    digest: &DeclarationDigest,
    policy: DigestPolicy,
    require_execution: bool,
    has_tests: bool,
) -> bool {
    let metadata = match metadata {
        MetadataLoad::Missing | MetadataLoad::Corrupt(_) => return true,
        MetadataLoad::Loaded(metadata) => metadata,
    };
    if (metadata.require_execution || require_execution) && !metadata.did_execute {
        return true;
    }
    if (metadata.has_tests || has_tests) && !metadata.did_pass_tests {
        return true;
    }
    !metadata.declaration_digest.matches(digest, policy)
}

/// Stands in for the model when no API key is configured, so cached and prod paths still work.
struct UnconfiguredModel {
    reason: String,
}

impl ModelClient for UnconfiguredModel {
    fn complete<'a>(&'a self, _messages: &'a [ChatMessage]) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { Err(CodespeakError::Model(self.reason.clone())) })
    }
}

pub struct Engine {
    config: Config,
    store: ArtifactStore,
    model: Box<dyn ModelClient>,
    runner: Box<dyn CodeRunner>,
    harness: Box<dyn TestHarness>,
}

impl Engine {
    pub fn new(
        config: Config,
        model: Box<dyn ModelClient>,
        runner: Box<dyn CodeRunner>,
        harness: Box<dyn TestHarness>,
    ) -> Self {
        let store = ArtifactStore::from_config(&config);
        Self {
            config,
            store,
            model,
            runner,
            harness,
        }
    }

    /// Wire the OpenAI client, the Python gateway and pytest from configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        let model: Box<dyn ModelClient> = match OpenAiClient::from_config(&config) {
            Ok(client) => Box::new(client),
            Err(err) => {
                tracing::debug!("model client unavailable: {}", err);
                Box::new(UnconfiguredModel {
                    reason: err.to_string(),
                })
            }
        };
        let runner = PythonGateway::new(
            &config.python,
            &config.project_root,
            config.execution_timeout(),
        );
        let harness =
            PytestHarness::new(&config.python, &config.project_root, config.test_timeout());
        Ok(Self::new(config, model, Box::new(runner), Box::new(harness)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn resolver(&self) -> ProjectResolver {
        ProjectResolver::new(&self.config.project_root)
    }

    /// Extract `module.qualname` from the project and wrap it in a handle.
    pub fn manage(&self, module: &str, qualname: &str) -> Result<ManagedFunction> {
        ManagedFunction::new(&mut self.resolver(), &self.store, module, qualname)
    }

    /// Whether the next call of `function` would go to the model.
    pub fn needs_codegen(&self, function: &ManagedFunction, require_execution: bool) -> bool {
        if !self.store.has_logic(&function.paths) {
            return true;
        }
        require_new_codegen(
            &self.store.load_metadata(&function.paths),
            &function.digest,
            self.config.digest_policy,
            require_execution,
            function.has_tests(),
        )
    }

    /// Run one call of a managed function. `None` generates (if needed) without executing.
    pub async fn call(
        &self,
        function: &mut ManagedFunction,
        invocation: Option<Invocation>,
    ) -> Result<Option<Value>> {
        if self.config.is_prod() {
            if !self.store.has_logic(&function.paths) {
                return Err(CodespeakError::MissingArtifact(function.paths.logic.clone()));
            }
            return self.run_cached(function, invocation.as_ref());
        }

        let mut resolver = self.resolver();
        function.refresh(&mut resolver)?;
        if invocation.as_ref().is_some_and(|inv| inv.receiver.is_some()) {
            function.bind_receiver(&mut resolver)?;
        }

        if !self.needs_codegen(function, invocation.is_some()) {
            match self.run_cached(function, invocation.as_ref()) {
                Err(err) if err.is_artifact_defect() => {
                    tracing::warn!(
                        qualname = %function.declaration.qualname,
                        "cached logic is unusable, regenerating: {}",
                        err
                    );
                }
                other => return other,
            }
        }

        let result = GenerationSession::new(self, function, invocation.as_ref())
            .run()
            .await;
        if self.config.auto_clean
            && (result.is_ok() || matches!(result, Err(CodespeakError::Intentional(_))))
        {
            self.clean();
        }
        result
    }

    fn run_cached(
        &self,
        function: &ManagedFunction,
        invocation: Option<&Invocation>,
    ) -> Result<Option<Value>> {
        let Some(invocation) = invocation else {
            return Ok(None);
        };
        let qualname = &function.declaration.qualname;
        match self
            .runner
            .load_and_call(&function.paths.logic, &function.declaration.name, invocation)?
        {
            ExecutionOutcome::Returned(value) => Ok(Some(value)),
            ExecutionOutcome::Intentional(inner) => Err(CodespeakError::Intentional(inner)),
            ExecutionOutcome::Raised(exc) => {
                tracing::warn!(
                    qualname = %qualname,
                    exception = %exc,
                    "unsafe exception: generated code raised without InferredException"
                );
                Err(CodespeakError::Raised(exc))
            }
        }
    }

    /// Remove artifacts whose functions no longer exist. Failures are logged, not returned.
    pub fn clean(&self) -> usize {
        let index = SourceIndex::new(&self.config.project_root);
        match remove_unused_artifacts(self.store.root(), &|module, qualname| {
            index.contains(module, qualname)
        }) {
            Ok(removed) => removed,
            Err(err) => {
                tracing::warn!("artifact cleanup failed: {}", err);
                0
            }
        }
    }
}
