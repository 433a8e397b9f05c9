pub mod config;
pub mod corpus;
pub mod executor;
pub mod fuzzer;
pub mod mutator;
pub mod recorder;

pub use config::{BitfuzzConfig, ConfigError};
pub use corpus::{CorpusError, SeedCorpus, WorkingFile};
pub use executor::{
    ExecutionOutcome, ExecutionSupervisor, ProcessHandle, ProcessRunner, SystemProcessRunner,
    TargetCommand,
};
pub use fuzzer::{CaseResult, FuzzError, Fuzzer, RunSummary};
pub use mutator::{BitFlipMutator, MutationError, MutationReport, Mutator, flip_bit};
pub use recorder::{CaseTrace, CrashRecorder, Verdict};
