//! How a [`TestInput`] reaches the target.
//!
//! A harness turns an input into a concrete [`Invocation`] inside the run's
//! scratch directory. It may write files there; it must not launch anything.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::input::TestInput;

/// Placeholder in harness arguments replaced by the scratch directory path.
pub const SCRATCH_PLACEHOLDER: &str = "{scratch}";

/// File name of the serialized input handed to launcher scripts.
pub const INPUT_ARTIFACT: &str = "input.json";

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("input file path escapes the scratch directory: {path}")]
    UnsafePath { path: String },

    #[error("cannot materialize {path}: {source}")]
    Materialize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize input: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("program not found: {}", program.display())]
    ProgramNotFound { program: PathBuf },
}

/// Which child stream carries the instrumentation markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStream {
    #[default]
    Stderr,
    Stdout,
}

/// A fully resolved process launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub trace_stream: TraceStream,
}

pub trait Harness: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn prepare(&self, input: &TestInput, scratch: &Path) -> Result<Invocation, HarnessError>;

    /// Fail early when the program to launch cannot be found.
    fn check(&self) -> Result<(), HarnessError>;
}

/// Runs the target directly: fixed prefix arguments followed by the input's
/// arguments, stdin piped, files written into the scratch directory.
#[derive(Debug, Clone)]
pub struct ArgvHarness {
    pub program: PathBuf,
    pub prefix_args: Vec<String>,
    /// Working directory; defaults to the scratch directory.
    pub cwd: Option<PathBuf>,
    pub trace_stream: TraceStream,
}

impl ArgvHarness {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            cwd: None,
            trace_stream: TraceStream::Stderr,
        }
    }

    pub fn with_prefix_args(mut self, args: Vec<String>) -> Self {
        self.prefix_args = args;
        self
    }
}

impl Harness for ArgvHarness {
    fn name(&self) -> &str {
        "argv"
    }

    fn prepare(&self, input: &TestInput, scratch: &Path) -> Result<Invocation, HarnessError> {
        materialize_files(input, scratch)?;

        let scratch_str = scratch.to_string_lossy();
        let args = self
            .prefix_args
            .iter()
            .chain(input.args.iter())
            .map(|arg| arg.replace(SCRATCH_PLACEHOLDER, &scratch_str))
            .collect();

        Ok(Invocation {
            program: self.program.clone(),
            args,
            stdin: input.stdin.as_ref().map(|s| s.as_bytes().to_vec()),
            env: input.env.clone(),
            cwd: self.cwd.clone().unwrap_or_else(|| scratch.to_path_buf()),
            trace_stream: self.trace_stream,
        })
    }

    fn check(&self) -> Result<(), HarnessError> {
        locate(&self.program).map(drop)
    }
}

/// Delegates launching to an external script. The script receives the path
/// of a JSON copy of the input, launches the target itself, and relays the
/// target's marker stream and exit status.
#[derive(Debug, Clone)]
pub struct ScriptHarness {
    pub script: PathBuf,
    /// Interpreter to run the script with (`bash`); `None` executes it directly.
    pub interpreter: Option<String>,
    pub cwd: Option<PathBuf>,
    pub trace_stream: TraceStream,
}

impl ScriptHarness {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            interpreter: None,
            cwd: None,
            trace_stream: TraceStream::Stderr,
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }
}

impl Harness for ScriptHarness {
    fn name(&self) -> &str {
        "script"
    }

    fn prepare(&self, input: &TestInput, scratch: &Path) -> Result<Invocation, HarnessError> {
        materialize_files(input, scratch)?;

        let artifact = scratch.join(INPUT_ARTIFACT);
        let json = serde_json::to_vec_pretty(input)?;
        std::fs::write(&artifact, json).map_err(|source| HarnessError::Materialize {
            path: artifact.clone(),
            source,
        })?;
        let artifact_arg = artifact.to_string_lossy().into_owned();

        let (program, args) = match &self.interpreter {
            Some(interp) => (
                PathBuf::from(interp),
                vec![self.script.to_string_lossy().into_owned(), artifact_arg],
            ),
            None => (self.script.clone(), vec![artifact_arg]),
        };

        Ok(Invocation {
            program,
            args,
            stdin: input.stdin.as_ref().map(|s| s.as_bytes().to_vec()),
            env: input.env.clone(),
            cwd: self.cwd.clone().unwrap_or_else(|| scratch.to_path_buf()),
            trace_stream: self.trace_stream,
        })
    }

    fn check(&self) -> Result<(), HarnessError> {
        match &self.interpreter {
            Some(interp) => {
                locate(Path::new(interp))?;
                if self.script.is_file() {
                    Ok(())
                } else {
                    Err(HarnessError::ProgramNotFound {
                        program: self.script.clone(),
                    })
                }
            }
            None => locate(&self.script).map(drop),
        }
    }
}

/// Resolve a program the way the child launch will: paths as given, bare
/// names through `PATH`.
fn locate(program: &Path) -> Result<PathBuf, HarnessError> {
    which::which(program).map_err(|_| HarnessError::ProgramNotFound {
        program: program.to_path_buf(),
    })
}

fn materialize_files(input: &TestInput, scratch: &Path) -> Result<(), HarnessError> {
    for (rel, contents) in &input.files {
        let rel_path = Path::new(rel);
        let safe = rel_path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe || rel.is_empty() {
            return Err(HarnessError::UnsafePath { path: rel.clone() });
        }
        let dest = scratch.join(rel_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|source| HarnessError::Materialize {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&dest, contents).map_err(|source| HarnessError::Materialize {
            path: dest.clone(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_prefix_and_placeholder() {
        let scratch = tempfile::tempdir().unwrap();
        let harness = ArgvHarness::new("/bin/target")
            .with_prefix_args(vec!["--config".into(), "{scratch}/cfg".into()]);
        let input = TestInput::from_args(["1.0"]).with_file("cfg", "x=1");

        let inv = harness.prepare(&input, scratch.path()).unwrap();
        let expected_cfg = format!("{}/cfg", scratch.path().display());
        assert_eq!(inv.args, vec!["--config".to_string(), expected_cfg, "1.0".to_string()]);
        assert_eq!(inv.cwd, scratch.path());
        assert_eq!(std::fs::read_to_string(scratch.path().join("cfg")).unwrap(), "x=1");
    }

    #[test]
    fn test_rejects_escaping_file_paths() {
        let scratch = tempfile::tempdir().unwrap();
        let harness = ArgvHarness::new("/bin/target");
        for bad in ["../evil", "/etc/passwd", ""] {
            let input = TestInput::default().with_file(bad, "x");
            let err = harness.prepare(&input, scratch.path()).unwrap_err();
            assert!(matches!(err, HarnessError::UnsafePath { .. }), "{bad}");
        }
    }

    #[test]
    fn test_script_harness_writes_artifact() {
        let scratch = tempfile::tempdir().unwrap();
        let harness = ScriptHarness::new("/opt/run.sh").with_interpreter("bash");
        let input = TestInput::from_args(["a", "b"]);

        let inv = harness.prepare(&input, scratch.path()).unwrap();
        assert_eq!(inv.program, PathBuf::from("bash"));
        assert_eq!(inv.args[0], "/opt/run.sh");

        let written = std::fs::read_to_string(&inv.args[1]).unwrap();
        let back: TestInput = serde_json::from_str(&written).unwrap();
        assert_eq!(back, input);
    }

    #[cfg(unix)]
    #[test]
    fn test_check_finds_programs() {
        assert!(ArgvHarness::new("/bin/sh").check().is_ok());
        assert!(ArgvHarness::new("sh").check().is_ok());
        assert!(matches!(
            ArgvHarness::new("/definitely/not/a/program").check(),
            Err(HarnessError::ProgramNotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_check_script_needs_interpreter_and_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("launch.sh");
        std::fs::write(&script, "exit 0\n").unwrap();

        assert!(ScriptHarness::new(&script).with_interpreter("sh").check().is_ok());
        assert!(ScriptHarness::new(dir.path().join("gone.sh"))
            .with_interpreter("sh")
            .check()
            .is_err());
        assert!(ScriptHarness::new(&script)
            .with_interpreter("no-such-interpreter-xyz")
            .check()
            .is_err());
    }
}
