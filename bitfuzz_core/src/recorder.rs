use crate::config::RecorderConfig;
use crate::executor::ExecutionOutcome;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// The narrative of one test case: which seed it came from, what was flipped,
/// and anything unusual that happened on the way. Reset every iteration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CaseTrace {
    lines: Vec<String>,
}

impl CaseTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Renders the log block for test `test_index`: each trace line, the
    /// terminal return-code line, then a blank separator.
    pub fn render_entry(&self, test_index: u64, return_code: i32) -> String {
        let mut entry = String::new();
        for line in &self.lines {
            entry.push_str(line);
            entry.push('\n');
        }
        entry.push_str(&format!("Return code (case {test_index}): {return_code}\n\n"));
        entry
    }
}

/// How the recorder classified an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Completed with exit code 0.
    Clean,
    /// Completed with a non-zero exit code.
    Crash,
    TimedOut,
    LaunchFailed,
}

impl Verdict {
    pub fn of(outcome: &ExecutionOutcome) -> Self {
        match outcome {
            ExecutionOutcome::Completed(0) => Verdict::Clean,
            ExecutionOutcome::Completed(_) => Verdict::Crash,
            ExecutionOutcome::TimedOut => Verdict::TimedOut,
            ExecutionOutcome::LaunchFailed(_) => Verdict::LaunchFailed,
        }
    }
}

/// Persists interesting test cases to an append-only log and keeps the
/// running crash count.
///
/// Only `Completed` outcomes with a non-zero exit code are crashes. A timeout
/// is deliberately not one, even though a hang may well be a target defect.
#[derive(Debug)]
pub struct CrashRecorder {
    log_path: PathBuf,
    crash_dir: Option<PathBuf>,
    crash_count: u64,
}

impl CrashRecorder {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            crash_dir: None,
            crash_count: 0,
        }
    }

    pub fn from_config(config: &RecorderConfig) -> Self {
        Self::new(&config.log_path).with_crash_dir(config.crash_dir.clone())
    }

    /// Crashing inputs are also copied into `crash_dir` when it is set.
    pub fn with_crash_dir(mut self, crash_dir: Option<PathBuf>) -> Self {
        self.crash_dir = crash_dir;
        self
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn crash_count(&self) -> u64 {
        self.crash_count
    }

    /// Classifies `outcome` and, for crashes, bumps the crash count and appends
    /// the case to the log. `input` is the working file the target ran against.
    pub fn record(
        &mut self,
        test_index: u64,
        outcome: &ExecutionOutcome,
        trace: &mut CaseTrace,
        input: &Path,
    ) -> Verdict {
        let verdict = Verdict::of(outcome);
        match outcome {
            ExecutionOutcome::Completed(code) if *code != 0 => {
                self.crash_count += 1;
                match fs::read(input) {
                    Ok(bytes) => {
                        let digest = format!("{:x}", md5::compute(&bytes));
                        trace.push(format!("Input MD5: {digest}"));
                        self.save_crashing_input(test_index, input, &digest);
                    }
                    Err(e) => warn!(
                        input = %input.display(),
                        "Could not read crashing input for digest: {e}"
                    ),
                }
                self.append_or_print(test_index, trace, *code);
                info!(
                    "Crash occurred on test {test_index} for a total of {} crashes.",
                    self.crash_count
                );
            }
            ExecutionOutcome::Completed(_) => {
                info!("Test case {test_index} exited normally.");
            }
            ExecutionOutcome::TimedOut => {
                info!("Test case {test_index} timed out, not counted as a crash.");
            }
            ExecutionOutcome::LaunchFailed(reason) => {
                warn!("Test case {test_index} could not launch the target: {reason}");
            }
        }
        verdict
    }

    /// Logs a test case that was abandoned before execution. Written with a
    /// return code of 0 and never counted as a crash.
    pub fn record_skipped(&mut self, test_index: u64, trace: &CaseTrace) {
        self.append_or_print(test_index, trace, 0);
    }

    fn append_or_print(&self, test_index: u64, trace: &CaseTrace, return_code: i32) {
        let entry = trace.render_entry(test_index, return_code);
        if let Err(e) = self.append_entry(&entry) {
            error!("Failed to write log file {:?}: {e}", self.log_path);
            error!("Attempted to write:\n{entry}");
        }
    }

    fn append_entry(&self, entry: &str) -> io::Result<()> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        log.write_all(entry.as_bytes())?;
        log.flush()
    }

    fn save_crashing_input(&self, test_index: u64, input: &Path, digest: &str) {
        let Some(dir) = &self.crash_dir else {
            return;
        };
        let mut name = OsString::from(format!("case-{test_index}-{digest}"));
        if let Some(ext) = input.extension() {
            name.push(".");
            name.push(ext);
        }
        let destination = dir.join(name);
        let saved = fs::create_dir_all(dir).and_then(|_| fs::copy(input, &destination));
        match saved {
            Ok(_) => info!(path = %destination.display(), "Saved crashing input"),
            Err(e) => warn!(
                path = %destination.display(),
                "Failed to save crashing input: {e}"
            ),
        }
    }
}
