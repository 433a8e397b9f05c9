use crate::recorder::CaseTrace;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// How often a waiting worker polls its child for exit.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of running the target against one working file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The target exited on its own with this code.
    Completed(i32),
    /// The target outlived the time budget and was killed.
    TimedOut,
    /// The target process was never created.
    LaunchFailed(String),
}

impl ExecutionOutcome {
    /// Exit code used for crash classification. A killed process counts as 0,
    /// as does one that never started.
    pub fn return_code(&self) -> i32 {
        match self {
            ExecutionOutcome::Completed(code) => *code,
            ExecutionOutcome::TimedOut | ExecutionOutcome::LaunchFailed(_) => 0,
        }
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed(code) if *code != 0)
    }
}

/// `<application> <input file>`, with the input file passed as a single argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCommand {
    pub application: PathBuf,
    pub input_file: PathBuf,
}

impl TargetCommand {
    pub fn new(application: impl Into<PathBuf>, input_file: impl Into<PathBuf>) -> Self {
        Self {
            application: application.into(),
            input_file: input_file.into(),
        }
    }
}

impl fmt::Display for TargetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.application.display(),
            self.input_file.display()
        )
    }
}

/// A running target process that one thread can wait on while another
/// terminates it.
pub trait ProcessHandle: Send + Sync {
    /// Blocks until the process exits and returns its exit code.
    fn wait(&self) -> io::Result<i32>;

    /// Forcibly ends the process. Terminating a process that already exited
    /// is not an error.
    fn terminate(&self) -> io::Result<()>;
}

/// Launches target processes.
pub trait ProcessRunner: Send + Sync {
    type Handle: ProcessHandle;

    fn start(&self, command: &TargetCommand) -> io::Result<Self::Handle>;
}

/// Runs targets as child processes of the fuzzer via `std::process`.
///
/// The child's stdin, stdout and stderr are all redirected to the null device.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    type Handle = ChildHandle;

    fn start(&self, command: &TargetCommand) -> io::Result<ChildHandle> {
        let child = Command::new(&command.application)
            .arg(&command.input_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        debug!(pid = child.id(), "Spawned target: {command}");
        Ok(ChildHandle {
            child: Mutex::new(child),
        })
    }
}

/// A spawned child. Waiting polls `try_wait` so the lock is never held across
/// a blocking call and `terminate` can always get in.
#[derive(Debug)]
pub struct ChildHandle {
    child: Mutex<Child>,
}

impl ChildHandle {
    fn lock(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessHandle for ChildHandle {
    fn wait(&self) -> io::Result<i32> {
        loop {
            if let Some(status) = self.lock().try_wait()? {
                return Ok(exit_code(status));
            }
            thread::sleep(CHILD_POLL_INTERVAL);
        }
    }

    fn terminate(&self) -> io::Result<()> {
        match self.lock().kill() {
            Ok(()) => Ok(()),
            // Older toolchains report an already-reaped child this way.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Exit code of a finished process. On Unix a signal death maps to
/// `128 + signal`, the shell convention, so it classifies as a crash.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// What the worker thread reports back when it is done.
enum WorkerReport {
    Exited(i32),
    LaunchFailed(String),
    WaitFailed(String),
}

/// Where the worker publishes the handle of the process it started, so the
/// supervisor can kill it. A cancellation that arrives before the handle does
/// is remembered and applied as soon as the handle is installed.
struct HandleSlot<H> {
    state: Mutex<SlotState<H>>,
}

struct SlotState<H> {
    handle: Option<Arc<H>>,
    cancelled: bool,
}

impl<H: ProcessHandle> HandleSlot<H> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                handle: None,
                cancelled: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<H>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install(&self, handle: Arc<H>) -> io::Result<()> {
        let mut state = self.lock();
        let cancelled = state.cancelled;
        state.handle = Some(Arc::clone(&handle));
        if cancelled {
            handle.terminate()
        } else {
            Ok(())
        }
    }

    fn cancel(&self) -> io::Result<()> {
        let mut state = self.lock();
        state.cancelled = true;
        match &state.handle {
            Some(handle) => handle.terminate(),
            None => Ok(()),
        }
    }
}

/// Launches the target for one test case and enforces the time budget.
///
/// Each call spawns a fresh worker thread that confirms it is about to start
/// the process, starts it, waits for it unboundedly and reports back. The
/// supervisor waits for that report for at most `timeout`. When the budget
/// runs out it kills the child and then waits, without a bound, for the
/// worker's final report. `execute` returns only after the worker has been
/// joined, so no process handle outlives the test case.
pub struct ExecutionSupervisor<P: ProcessRunner> {
    runner: P,
    application: PathBuf,
    timeout: Duration,
}

impl<P: ProcessRunner> ExecutionSupervisor<P> {
    pub fn new(runner: P, application: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            application: application.into(),
            timeout,
        }
    }

    /// Runs the target against `input_file`. Timeouts are noted in `trace`.
    pub fn execute(&self, input_file: &Path, trace: &mut CaseTrace) -> ExecutionOutcome {
        let command = TargetCommand::new(&self.application, input_file);
        let slot = HandleSlot::new();
        let (started_tx, started_rx) = mpsc::sync_channel::<()>(1);
        let (done_tx, done_rx) = mpsc::sync_channel::<WorkerReport>(1);

        thread::scope(|scope| {
            let worker = thread::Builder::new()
                .name("bitfuzz-exec".to_string())
                .spawn_scoped(scope, || {
                    run_worker(&self.runner, &command, &slot, started_tx, done_tx)
                });
            let worker = match worker {
                Ok(handle) => handle,
                Err(e) => {
                    return ExecutionOutcome::LaunchFailed(format!(
                        "Failed to spawn execution worker: {e}"
                    ));
                }
            };

            let outcome = if started_rx.recv().is_err() {
                ExecutionOutcome::LaunchFailed(
                    "Execution worker exited before confirming start".to_string(),
                )
            } else {
                match done_rx.recv_timeout(self.timeout) {
                    Ok(report) => report.into_outcome(),
                    Err(RecvTimeoutError::Timeout) => {
                        warn!("Process timed out after {:?}: {command}", self.timeout);
                        trace.push("Process timed out.");
                        if let Err(e) = slot.cancel() {
                            error!("Failed to terminate timed-out process: {e}");
                        }
                        // The worker still owns the handle; let it finish tearing down.
                        let _ = done_rx.recv();
                        ExecutionOutcome::TimedOut
                    }
                    Err(RecvTimeoutError::Disconnected) => ExecutionOutcome::LaunchFailed(
                        "Execution worker exited without reporting".to_string(),
                    ),
                }
            };

            if worker.join().is_err() {
                error!("Execution worker panicked");
            }
            outcome
        })
    }
}

impl WorkerReport {
    fn into_outcome(self) -> ExecutionOutcome {
        match self {
            WorkerReport::Exited(code) => ExecutionOutcome::Completed(code),
            WorkerReport::LaunchFailed(reason) => ExecutionOutcome::LaunchFailed(reason),
            WorkerReport::WaitFailed(reason) => {
                ExecutionOutcome::LaunchFailed(format!("Lost track of target process: {reason}"))
            }
        }
    }
}

fn run_worker<P: ProcessRunner>(
    runner: &P,
    command: &TargetCommand,
    slot: &HandleSlot<P::Handle>,
    started: SyncSender<()>,
    done: SyncSender<WorkerReport>,
) {
    // A closed receiver means the supervisor is gone; there is nobody to tell.
    let _ = started.send(());

    let report = match runner.start(command) {
        Err(e) => {
            warn!("Failed to launch application: {e}");
            WorkerReport::LaunchFailed(format!("Failed to launch application ({e})"))
        }
        Ok(handle) => {
            let handle = Arc::new(handle);
            if let Err(e) = slot.install(Arc::clone(&handle)) {
                error!("Failed to terminate process started after timeout: {e}");
            }
            match handle.wait() {
                Ok(code) => WorkerReport::Exited(code),
                Err(e) => {
                    error!("Error waiting for target process: {e}");
                    let _ = handle.terminate();
                    WorkerReport::WaitFailed(e.to_string())
                }
            }
        }
    };

    let _ = done.send(report);
}
