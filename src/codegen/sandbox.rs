use super::CodegenError;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// How the fixed entry point of a synthesized routine is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutineCall {
    /// `entry_point()` with no arguments.
    NoArgs { entry_point: String },
    /// `entry_point(df)` where `df` is the CSV at `csv_path` loaded with
    /// pandas. The path must be absolute; the routine runs in its own
    /// scratch directory.
    WithDataframe {
        entry_point: String,
        csv_path: PathBuf,
    },
}

impl RoutineCall {
    pub fn entry_point(&self) -> &str {
        match self {
            RoutineCall::NoArgs { entry_point } => entry_point,
            RoutineCall::WithDataframe { entry_point, .. } => entry_point,
        }
    }
}

/// Output of one sandboxed execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxRun {
    /// Trimmed stdout of the driver; the entry point's return value as JSON.
    pub output: String,
    /// Bytes of the file the routine reported writing, when the report names
    /// an existing file in the scratch directory.
    pub produced_file: Option<(String, Vec<u8>)>,
}

/// Executes synthesized routines. Every execution cycle gets a fresh scratch
/// directory with the routine, a generated driver, and nothing else; the
/// directory is removed afterwards. Cycles cannot observe each other.
#[derive(Debug, Clone)]
pub struct RoutineSandbox {
    python_binary: String,
    scratch_root: PathBuf,
    timeout: Duration,
}

impl RoutineSandbox {
    pub fn new(
        python_binary: impl Into<String>,
        scratch_root: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            python_binary: python_binary.into(),
            scratch_root: scratch_root.into(),
            timeout,
        }
    }

    pub fn execute(&self, routine: &str, call: &RoutineCall) -> Result<SandboxRun, CodegenError> {
        let cycle_dir = self.scratch_root.join(cycle_dir_name());
        fs::create_dir_all(&cycle_dir).map_err(|source| io_error(&cycle_dir, source))?;
        let guard = ScratchGuard {
            path: cycle_dir.clone(),
        };

        let routine_path = cycle_dir.join("routine.py");
        fs::write(&routine_path, routine).map_err(|source| io_error(&routine_path, source))?;
        let driver_path = cycle_dir.join("driver.py");
        fs::write(&driver_path, render_driver(call))
            .map_err(|source| io_error(&driver_path, source))?;

        let output = self.run_driver(&cycle_dir)?;
        let produced_file = harvest_reported_file(&cycle_dir, &output);

        drop(guard);
        Ok(SandboxRun {
            output,
            produced_file,
        })
    }

    fn run_driver(&self, cycle_dir: &Path) -> Result<String, CodegenError> {
        let mut command = Command::new(&self.python_binary);
        command
            .arg("driver.py")
            .current_dir(cycle_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CodegenError::MissingInterpreter {
                    binary: self.python_binary.clone(),
                })
            }
            Err(err) => return Err(io_error(cycle_dir, err)),
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(cycle_dir, std::io::Error::other("missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_error(cycle_dir, std::io::Error::other("missing stderr pipe")))?;

        let stdout_reader = thread::spawn(move || {
            let mut buf = String::new();
            let mut reader = BufReader::new(stdout);
            let _ = reader.read_to_string(&mut buf);
            buf
        });
        let stderr_reader = thread::spawn(move || {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf);
            buf
        });

        let start = Instant::now();
        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() > self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = stdout_reader.join();
                        let _ = stderr_reader.join();
                        return Err(CodegenError::ExecutionTimeout {
                            timeout_ms: self.timeout.as_millis() as u64,
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(io_error(cycle_dir, err)),
            }
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !exit_status.success() {
            return Err(CodegenError::ExecutionFailed {
                exit_code: exit_status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(stdout.trim().to_string())
    }
}

/// Renders the driver that imports the routine and invokes its entry point,
/// printing the result as JSON on stdout.
pub(crate) fn render_driver(call: &RoutineCall) -> String {
    match call {
        RoutineCall::NoArgs { entry_point } => format!(
            "import json\n\nfrom routine import {entry_point}\n\nresult = {entry_point}()\nprint(json.dumps(result))\n"
        ),
        RoutineCall::WithDataframe {
            entry_point,
            csv_path,
        } => {
            let literal = serde_json::to_string(&csv_path.display().to_string())
                .expect("path literal encodes");
            format!(
                "import json\n\nimport pandas as pd\n\nfrom routine import {entry_point}\n\nframe = pd.read_csv({literal})\nresult = {entry_point}(frame)\nprint(json.dumps(result))\n"
            )
        }
    }
}

/// If stdout names a file (a JSON string) that the routine wrote inside the
/// scratch directory, read it before the directory is disposed.
fn harvest_reported_file(cycle_dir: &Path, output: &str) -> Option<(String, Vec<u8>)> {
    let name: String = serde_json::from_str(output).ok()?;
    let relative = Path::new(&name);
    if relative.is_absolute() || name.contains("..") {
        return None;
    }
    let candidate = cycle_dir.join(relative);
    let bytes = fs::read(candidate).ok()?;
    Some((name, bytes))
}

fn cycle_dir_name() -> String {
    let mut raw = [0_u8; 4];
    let hex: String = if getrandom::getrandom(&mut raw).is_ok() {
        raw.iter().map(|b| format!("{b:02x}")).collect()
    } else {
        "0000".to_string()
    };
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("cycle-{}-{nanos}-{hex}", std::process::id())
}

fn io_error(path: &Path, source: std::io::Error) -> CodegenError {
    CodegenError::Io {
        path: path.display().to_string(),
        source,
    }
}

struct ScratchGuard {
    path: PathBuf,
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_for_no_args_calls_the_entry_point_bare() {
        let driver = render_driver(&RoutineCall::NoArgs {
            entry_point: "generate_query".to_string(),
        });
        assert!(driver.contains("from routine import generate_query"));
        assert!(driver.contains("result = generate_query()"));
        assert!(driver.contains("print(json.dumps(result))"));
        assert!(!driver.contains("pandas"));
    }

    #[test]
    fn driver_for_dataframe_loads_the_csv_first() {
        let driver = render_driver(&RoutineCall::WithDataframe {
            entry_point: "generate_method".to_string(),
            csv_path: PathBuf::from("/state/scratch/rec-1.csv"),
        });
        assert!(driver.contains("import pandas as pd"));
        assert!(driver.contains("pd.read_csv(\"/state/scratch/rec-1.csv\")"));
        assert!(driver.contains("result = generate_method(frame)"));
    }

    #[test]
    fn cycle_dir_names_never_repeat() {
        let a = cycle_dir_name();
        let b = cycle_dir_name();
        assert_ne!(a, b);
        assert!(a.starts_with("cycle-"));
    }

    #[test]
    fn harvest_reads_only_reported_scratch_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("static")).expect("mkdir");
        fs::write(temp.path().join("static/chart.png"), b"png-bytes").expect("write");

        let harvested = harvest_reported_file(temp.path(), "\"static/chart.png\"")
            .expect("harvest");
        assert_eq!(harvested.0, "static/chart.png");
        assert_eq!(harvested.1, b"png-bytes");

        assert!(harvest_reported_file(temp.path(), "\"missing.png\"").is_none());
        assert!(harvest_reported_file(temp.path(), "not json").is_none());
        assert!(harvest_reported_file(temp.path(), "\"../escape.png\"").is_none());
    }

    #[test]
    fn missing_interpreter_is_a_typed_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = RoutineSandbox::new(
            "definitely-not-a-python-binary",
            temp.path(),
            Duration::from_secs(1),
        );
        let err = sandbox
            .execute(
                "def generate_query():\n    return []",
                &RoutineCall::NoArgs {
                    entry_point: "generate_query".to_string(),
                },
            )
            .expect_err("missing binary");
        assert!(matches!(err, CodegenError::MissingInterpreter { .. }));
    }

    #[test]
    fn scratch_guard_disposes_the_cycle_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cycle-x");
        fs::create_dir_all(&path).expect("mkdir");
        fs::write(path.join("routine.py"), "x = 1").expect("write");
        drop(ScratchGuard { path: path.clone() });
        assert!(!path.exists());
    }
}
