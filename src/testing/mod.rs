//! Test alignment: run one attached pytest test against candidate logic.
//!
//! The driver registers the candidate as a pytest fixture named after the function (and as
//! `codespeak_candidate`), so a test written as `def test_add(add): ...` receives the freshly
//! generated implementation. It is also bound onto the declaring module before collection, so
//! a test that does `from mathlib import add` sees the candidate instead of the stub.

use crate::declaration::TestFunction;
use crate::error::{CodespeakError, Result};
use crate::execute::SENTINEL_SOURCE;
use crate::util::{run_command_with_timeout, truncate};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use uuid::Uuid;

const DRIVER: &str = include_str!("pytest_driver.py");

/// pytest exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Ok,
    TestsFailed,
    Interrupted,
    InternalError,
    UsageError,
    NoTestsCollected,
    Unknown(i32),
}

impl ExitStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ExitStatus::Ok,
            1 => ExitStatus::TestsFailed,
            2 => ExitStatus::Interrupted,
            3 => ExitStatus::InternalError,
            4 => ExitStatus::UsageError,
            5 => ExitStatus::NoTestsCollected,
            other => ExitStatus::Unknown(other),
        }
    }

    /// Anything other than a pass or an ordinary test failure.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, ExitStatus::Ok | ExitStatus::TestsFailed)
    }

    pub fn description(&self) -> String {
        match self {
            ExitStatus::Ok => "All tests passed.".to_string(),
            ExitStatus::TestsFailed => "Tests failed.".to_string(),
            ExitStatus::Interrupted => "Test execution interrupted by the user.".to_string(),
            ExitStatus::InternalError => {
                "Internal error or exception occurred during test execution.".to_string()
            }
            ExitStatus::UsageError => "Usage error in pytest command line.".to_string(),
            ExitStatus::NoTestsCollected => "No tests were collected or executed.".to_string(),
            ExitStatus::Unknown(code) => format!("Unknown exit code: {}", code),
        }
    }
}

/// Where and why a test failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    pub path: String,
    pub lineno: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestRunReport {
    pub exit_status: ExitStatus,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub duration_secs: f64,
    pub crash_reports: Vec<CrashReport>,
}

impl TestRunReport {
    pub fn passed(&self) -> bool {
        self.exit_status == ExitStatus::Ok
    }

    /// The crash report of a failed single-test run.
    pub fn single_crash(&self) -> Result<&CrashReport> {
        match self.crash_reports.as_slice() {
            [] => Err(CodespeakError::MissingCrashReport),
            [crash] => Ok(crash),
            many => Err(CodespeakError::TooManyCrashReports(many.len())),
        }
    }
}

/// Generated logic offered to a test.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub logic_path: PathBuf,
    pub function_name: String,
    /// Dotted module and qualname of the stub the candidate replaces.
    pub declared_in: Option<(String, String)>,
}

impl Candidate {
    pub fn new(logic_path: impl Into<PathBuf>, function_name: impl Into<String>) -> Self {
        Self {
            logic_path: logic_path.into(),
            function_name: function_name.into(),
            declared_in: None,
        }
    }

    pub fn declared_in(mut self, module: impl Into<String>, qualname: impl Into<String>) -> Self {
        self.declared_in = Some((module.into(), qualname.into()));
        self
    }
}

pub trait TestHarness: Send + Sync {
    fn run(&self, test: &TestFunction, candidate: &Candidate) -> Result<TestRunReport>;
}

#[derive(Debug, Deserialize)]
struct DriverReply {
    exit_code: i32,
    passed: usize,
    failed: usize,
    skipped: usize,
    errors: usize,
    duration_secs: f64,
    crash_reports: Vec<CrashReport>,
}

/// Runs a single test node with pytest in a Python subprocess.
#[derive(Debug, Clone)]
pub struct PytestHarness {
    python: String,
    project_root: PathBuf,
    timeout: Duration,
}

impl PytestHarness {
    pub fn new(python: impl Into<String>, project_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            python: python.into(),
            project_root: project_root.into(),
            timeout,
        }
    }

    fn interpret(&self, output: &Path, result: crate::util::CommandRunResult) -> Result<TestRunReport> {
        if result.timed_out {
            let _ = fs::remove_file(output);
            return Ok(TestRunReport {
                exit_status: ExitStatus::Interrupted,
                passed: 0,
                failed: 0,
                skipped: 0,
                errors: 0,
                duration_secs: self.timeout.as_secs_f64(),
                crash_reports: Vec::new(),
            });
        }
        let text = fs::read_to_string(output).map_err(|_| {
            CodespeakError::Gateway(format!(
                "pytest driver exited with {:?} without a result: {}",
                result.status.and_then(|s| s.code()),
                truncate(result.stderr.trim(), 2000)
            ))
        })?;
        let _ = fs::remove_file(output);
        let reply: DriverReply = serde_json::from_str(&text)?;
        Ok(TestRunReport {
            exit_status: ExitStatus::from_code(reply.exit_code),
            passed: reply.passed,
            failed: reply.failed,
            skipped: reply.skipped,
            errors: reply.errors,
            duration_secs: reply.duration_secs,
            crash_reports: reply.crash_reports,
        })
    }
}

impl TestHarness for PytestHarness {
    fn run(&self, test: &TestFunction, candidate: &Candidate) -> Result<TestRunReport> {
        let output = std::env::temp_dir().join(format!("codespeak-test-{}.json", Uuid::new_v4()));
        let request = json!({
            "project_root": self.project_root,
            "node_id": test.node_id(),
            "logic_path": candidate.logic_path,
            "function_name": candidate.function_name,
            "declared_in": candidate.declared_in,
            "sentinel_source": SENTINEL_SOURCE,
            "output": output,
        });
        let input = serde_json::to_vec(&request)?;

        let mut command = Command::new(&self.python);
        command
            .arg("-c")
            .arg(DRIVER)
            .current_dir(&self.project_root)
            .env("PYTHONDONTWRITEBYTECODE", "1");

        tracing::debug!(node = %test.node_id(), "running test");
        let result = run_command_with_timeout(&mut command, Some(&input), self.timeout)
            .map_err(CodespeakError::Gateway)?;
        let report = self.interpret(&output, result)?;
        tracing::debug!(
            node = %test.node_id(),
            status = ?report.exit_status,
            passed = report.passed,
            failed = report.failed,
            "test run finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::find_on_path;

    fn report(status: ExitStatus, crashes: usize) -> TestRunReport {
        TestRunReport {
            exit_status: status,
            passed: 0,
            failed: crashes,
            skipped: 0,
            errors: 0,
            duration_secs: 0.1,
            crash_reports: (0..crashes)
                .map(|i| CrashReport {
                    path: "tests/test_math.py".into(),
                    lineno: Some(i as u32 + 1),
                    message: "assert 4 == 5".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn exit_code_taxonomy() {
        assert_eq!(ExitStatus::from_code(0), ExitStatus::Ok);
        assert_eq!(ExitStatus::from_code(1), ExitStatus::TestsFailed);
        assert!(!ExitStatus::TestsFailed.is_abnormal());
        for code in 2..=5 {
            assert!(ExitStatus::from_code(code).is_abnormal());
        }
        assert_eq!(
            ExitStatus::from_code(5).description(),
            "No tests were collected or executed."
        );
        assert_eq!(ExitStatus::from_code(9), ExitStatus::Unknown(9));
        assert!(ExitStatus::Unknown(9).is_abnormal());
    }

    #[test]
    fn single_crash_requires_exactly_one_report() {
        assert!(matches!(
            report(ExitStatus::TestsFailed, 0).single_crash(),
            Err(CodespeakError::MissingCrashReport)
        ));
        assert_eq!(
            report(ExitStatus::TestsFailed, 1).single_crash().unwrap().lineno,
            Some(1)
        );
        assert!(matches!(
            report(ExitStatus::TestsFailed, 2).single_crash(),
            Err(CodespeakError::TooManyCrashReports(2))
        ));
    }

    fn harness(root: &Path) -> Option<PytestHarness> {
        find_on_path("python3")?;
        let has_pytest = Command::new("python3").args(["-c", "import pytest"]).output().ok()?;
        if !has_pytest.status.success() {
            return None;
        }
        Some(PytestHarness::new("python3", root, Duration::from_secs(60)))
    }

    #[test]
    fn injects_candidate_as_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let Some(harness) = harness(dir.path()) else { return };
        fs::write(
            dir.path().join("test_math.py"),
            "def test_add(add):\n    assert add(2, 3) == 5\n",
        )
        .unwrap();
        let test = TestFunction::extract(&dir.path().join("test_math.py"), "test_add").unwrap();

        let good = dir.path().join("good.py");
        fs::write(&good, "def add(a, b):\n    return a + b\n").unwrap();
        let passed = harness
            .run(&test, &Candidate::new(good, "add"))
            .unwrap();
        assert!(passed.passed());
        assert_eq!(passed.passed, 1);

        let bad = dir.path().join("bad.py");
        fs::write(&bad, "def add(a, b):\n    return a - b\n").unwrap();
        let failed = harness
            .run(&test, &Candidate::new(bad, "add"))
            .unwrap();
        assert_eq!(failed.exit_status, ExitStatus::TestsFailed);
        let crash = failed.single_crash().unwrap();
        assert!(crash.message.contains("assert"));
    }

    #[test]
    fn binds_candidate_onto_declaring_module() {
        let dir = tempfile::tempdir().unwrap();
        let Some(harness) = harness(dir.path()) else { return };
        fs::write(
            dir.path().join("mathlib.py"),
            "def add(a: int, b: int) -> int:\n    \"\"\"adds two numbers\"\"\"\n    ...\n\n\n\
             class Counter:\n    def bump(self, by: int) -> int:\n        ...\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("test_direct.py"),
            "import mathlib\nfrom mathlib import add\n\n\n\
             def test_add():\n    assert add(2, 3) == 5\n\n\n\
             def test_bump():\n    assert mathlib.Counter().bump(4) == 5\n",
        )
        .unwrap();
        let logic = dir.path().join("logic.py");
        fs::write(&logic, "def add(a, b):\n    return a + b\n\n\ndef bump(self, by):\n    return by + 1\n").unwrap();

        let add = TestFunction::extract(&dir.path().join("test_direct.py"), "test_add").unwrap();
        let report = harness
            .run(&add, &Candidate::new(&logic, "add").declared_in("mathlib", "add"))
            .unwrap();
        assert!(report.passed(), "{:?}", report);

        let bump = TestFunction::extract(&dir.path().join("test_direct.py"), "test_bump").unwrap();
        let report = harness
            .run(&bump, &Candidate::new(&logic, "bump").declared_in("mathlib", "Counter.bump"))
            .unwrap();
        assert!(report.passed(), "{:?}", report);

        let unbound = harness.run(&add, &Candidate::new(&logic, "add")).unwrap();
        assert_eq!(unbound.exit_status, ExitStatus::TestsFailed);
    }

    #[test]
    fn candidate_that_fails_to_load_is_a_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let Some(harness) = harness(dir.path()) else { return };
        fs::write(dir.path().join("test_math.py"), "def test_add(add):\n    assert add(1, 1) == 2\n").unwrap();
        let test = TestFunction::extract(&dir.path().join("test_math.py"), "test_add").unwrap();
        let broken = dir.path().join("broken.py");
        fs::write(&broken, "def add(a, b)\n").unwrap();

        let report = harness
            .run(&test, &Candidate::new(broken, "add"))
            .unwrap();
        assert_eq!(report.exit_status, ExitStatus::TestsFailed);
        assert!(report.single_crash().unwrap().message.contains("SyntaxError"));
    }
}
