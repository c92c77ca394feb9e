//! Execution gateway: load a generated module in a Python subprocess and call its function.
//!
//! The driver script receives the request as JSON on stdin and writes its verdict to a temp
//! file, so anything the generated code prints cannot corrupt the result.

use crate::error::{CodespeakError, Result};
use crate::util::run_command_with_timeout;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use uuid::Uuid;

pub const SENTINEL_MODULE: &str = "codespeak";
pub const SENTINEL_QUALNAME: &str = "InferredException";
pub const SENTINEL_SOURCE: &str = include_str!("inferred_exception.py");

const DRIVER: &str = include_str!("driver.py");

/// A Python exception that crossed the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaisedException {
    pub type_name: String,
    pub message: String,
    #[serde(default)]
    pub traceback: Option<String>,
}

impl RaisedException {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            traceback: None,
        }
    }

    /// Text handed back to the model: the traceback when there is one.
    pub fn report(&self) -> String {
        match &self.traceback {
            Some(tb) if !tb.trim().is_empty() => tb.trim_end().to_string(),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for RaisedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Instance a method is called on, rebuilt in the subprocess from its attribute state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receiver {
    pub module: String,
    pub class: String,
    #[serde(default)]
    pub state: BTreeMap<String, Value>,
}

/// Call arguments captured for one invocation of a managed function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
    #[serde(default)]
    pub receiver: Option<Receiver>,
}

impl Invocation {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            ..Self::default()
        }
    }

    pub fn with_kwarg(mut self, name: &str, value: Value) -> Self {
        self.kwargs.insert(name.to_string(), value);
        self
    }

    pub fn with_receiver(mut self, receiver: Receiver) -> Self {
        self.receiver = Some(receiver);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Returned(Value),
    /// Raised through the sentinel; carries the unwrapped inner exception.
    Intentional(RaisedException),
    Raised(RaisedException),
}

/// Loads generated logic and calls it.
pub trait CodeRunner: Send + Sync {
    /// Fails with `Load` when the module cannot be imported and `Lookup` when it lacks the
    /// function; exceptions raised by the call itself are outcomes, not errors.
    fn load_and_call(
        &self,
        logic_path: &Path,
        function_name: &str,
        invocation: &Invocation,
    ) -> Result<ExecutionOutcome>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum DriverReply {
    Ok { value: Value },
    Intentional { error: RaisedException },
    Raised { error: RaisedException },
    LoadError { error: RaisedException },
    LookupError { error: RaisedException },
}

/// Runs generated code with a real Python interpreter.
#[derive(Debug, Clone)]
pub struct PythonGateway {
    python: String,
    project_root: PathBuf,
    timeout: Duration,
}

impl PythonGateway {
    pub fn new(python: impl Into<String>, project_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            python: python.into(),
            project_root: project_root.into(),
            timeout,
        }
    }

    fn run_driver(&self, request: &Value, output: &Path) -> Result<DriverReply> {
        let input = serde_json::to_vec(request)?;
        let mut command = Command::new(&self.python);
        command
            .arg("-c")
            .arg(DRIVER)
            .current_dir(&self.project_root)
            .env("PYTHONDONTWRITEBYTECODE", "1");

        let result = run_command_with_timeout(&mut command, Some(&input), self.timeout)
            .map_err(CodespeakError::Gateway)?;
        let reply = fs::read_to_string(output);
        let _ = fs::remove_file(output);

        if result.timed_out {
            return Ok(DriverReply::Raised {
                error: RaisedException::new(
                    "TimeoutError",
                    format!("execution did not finish within {}s", self.timeout.as_secs()),
                ),
            });
        }
        match reply {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                CodespeakError::Gateway(format!(
                    "unreadable driver result ({}): {}",
                    e,
                    crate::util::truncate(&text, 500)
                ))
            }),
            Err(_) => Err(CodespeakError::Gateway(format!(
                "driver exited with {:?} without a result: {}",
                result.status.and_then(|s| s.code()),
                crate::util::truncate(result.stderr.trim(), 2000)
            ))),
        }
    }
}

impl CodeRunner for PythonGateway {
    fn load_and_call(
        &self,
        logic_path: &Path,
        function_name: &str,
        invocation: &Invocation,
    ) -> Result<ExecutionOutcome> {
        if !logic_path.is_file() {
            return Err(CodespeakError::Load(format!(
                "{} does not exist",
                logic_path.display()
            )));
        }
        let output = std::env::temp_dir().join(format!("codespeak-exec-{}.json", Uuid::new_v4()));
        let request = json!({
            "project_root": self.project_root,
            "logic_path": logic_path,
            "function_name": function_name,
            "args": invocation.args,
            "kwargs": invocation.kwargs,
            "receiver": invocation.receiver,
            "sentinel_source": SENTINEL_SOURCE,
            "output": output,
        });

        match self.run_driver(&request, &output)? {
            DriverReply::Ok { value } => Ok(ExecutionOutcome::Returned(value)),
            DriverReply::Intentional { error } => Ok(ExecutionOutcome::Intentional(error)),
            DriverReply::Raised { error } => Ok(ExecutionOutcome::Raised(error)),
            DriverReply::LoadError { error } => Err(CodespeakError::Load(error.report())),
            DriverReply::LookupError { error } => Err(CodespeakError::Lookup(format!(
                "{} ({})",
                function_name, error.message
            ))),
        }
    }
}
