use crate::config::BitfuzzConfig;
use crate::corpus::{CorpusError, SeedCorpus};
use crate::executor::{ExecutionOutcome, ExecutionSupervisor, ProcessRunner, SystemProcessRunner};
use crate::mutator::{BitFlipMutator, Mutator};
use crate::recorder::{CaseTrace, CrashRecorder, Verdict};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that end a fuzzing run. Everything else is handled per test case.
#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("Fuzzing setup failed: {0}")]
    Setup(#[from] CorpusError),
}

/// Totals for a run, also available while it is in progress.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Test cases started, including skipped ones.
    pub tests: u64,
    /// Test cases where the target was actually run.
    pub executions: u64,
    pub crashes: u64,
    pub timeouts: u64,
    pub launch_failures: u64,
    /// Test cases abandoned because the input could not be generated.
    pub skipped: u64,
}

/// What happened to a single test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseResult {
    Skipped { reason: String },
    Executed {
        outcome: ExecutionOutcome,
        verdict: Verdict,
    },
}

/// Drives the fuzz loop: pick a seed, corrupt a copy, run the target on it,
/// record the outcome, repeat.
///
/// Test cases run strictly one after another; the next case's working file is
/// not touched until the previous case's worker has been joined.
pub struct Fuzzer<R, P, M = BitFlipMutator>
where
    R: Rng,
    P: ProcessRunner,
    M: Mutator<R>,
{
    corpus: SeedCorpus,
    mutator: M,
    supervisor: ExecutionSupervisor<P>,
    recorder: CrashRecorder,
    rng: R,
    max_executions: u64,
    summary: RunSummary,
}

impl<R, P, M> Fuzzer<R, P, M>
where
    R: Rng,
    P: ProcessRunner,
    M: Mutator<R>,
{
    /// `max_executions == 0` runs until the process is killed.
    pub fn new(
        corpus: SeedCorpus,
        mutator: M,
        supervisor: ExecutionSupervisor<P>,
        recorder: CrashRecorder,
        rng: R,
        max_executions: u64,
    ) -> Self {
        Self {
            corpus,
            mutator,
            supervisor,
            recorder,
            rng,
            max_executions,
            summary: RunSummary::default(),
        }
    }

    pub fn is_good(&self) -> bool {
        !self.corpus.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        !self.is_good() || (self.max_executions > 0 && self.summary.tests >= self.max_executions)
    }

    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    pub fn recorder(&self) -> &CrashRecorder {
        &self.recorder
    }

    /// Runs test cases until the iteration limit is reached. Fails immediately,
    /// before any test case, if no seeds are registered.
    pub fn run(&mut self) -> Result<RunSummary, FuzzError> {
        if !self.is_good() {
            return Err(CorpusError::CorpusIsEmpty.into());
        }
        while !self.is_finished() {
            self.run_next_test()?;
        }
        Ok(self.summary)
    }

    /// Runs one test case. Only corpus failures propagate; a mutation failure
    /// skips the case, and every execution outcome is recorded and absorbed.
    pub fn run_next_test(&mut self) -> Result<CaseResult, FuzzError> {
        self.summary.tests += 1;
        let test = self.summary.tests;

        let mut trace = CaseTrace::new();
        info!("Beginning test case {test}.");
        trace.push(format!("Beginning test case {test}."));

        let working_file = self.corpus.select(&mut self.rng, &mut trace)?;

        if let Err(e) = self
            .mutator
            .mutate(working_file.path(), &mut self.rng, &mut trace)
        {
            warn!("Skipping test case {test}: {e}");
            trace.push(format!("Fuzzer Error: Failed to generate input file! {e}"));
            self.recorder.record_skipped(test, &trace);
            self.summary.skipped += 1;
            return Ok(CaseResult::Skipped {
                reason: e.to_string(),
            });
        }

        let outcome = self.supervisor.execute(working_file.path(), &mut trace);
        self.summary.executions += 1;

        let verdict = self
            .recorder
            .record(test, &outcome, &mut trace, working_file.path());
        match verdict {
            Verdict::Crash => self.summary.crashes = self.recorder.crash_count(),
            Verdict::TimedOut => self.summary.timeouts += 1,
            Verdict::LaunchFailed => self.summary.launch_failures += 1,
            Verdict::Clean => {}
        }

        info!(
            test,
            return_code = outcome.return_code(),
            crashes = self.summary.crashes,
            "Finished test case {test} ({verdict:?})"
        );
        Ok(CaseResult::Executed { outcome, verdict })
    }
}

/// Seeds a ChaCha RNG from `seed`, or from the thread RNG when none is given.
/// Returns the seed used so the run can be replayed.
pub fn seeded_rng(seed: Option<u64>) -> (ChaCha8Rng, u64) {
    let seed = seed.unwrap_or_else(rand::random);
    (ChaCha8Rng::seed_from_u64(seed), seed)
}

impl Fuzzer<ChaCha8Rng, SystemProcessRunner> {
    /// Builds a fuzzer that runs real processes, with every seed listed in
    /// `config` registered.
    pub fn from_config(config: &BitfuzzConfig) -> Self {
        let mut corpus = SeedCorpus::new(
            &config.corpus.working_dir,
            config.corpus.working_file_stem.as_str(),
        );
        for seed in &config.corpus.seed_paths {
            corpus.add_seed(seed);
        }
        let (rng, seed) = seeded_rng(config.fuzzer.rng_seed);
        info!("Using RNG seed {seed}");

        Fuzzer::new(
            corpus,
            BitFlipMutator::new(config.fuzzer.max_bits_to_flip),
            ExecutionSupervisor::new(
                SystemProcessRunner,
                &config.target.application,
                config.target.timeout(),
            ),
            CrashRecorder::from_config(&config.recorder),
            rng,
            config.fuzzer.max_executions,
        )
    }
}
