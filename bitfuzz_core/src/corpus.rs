use crate::recorder::CaseTrace;
use rand::Rng;
use rand_core::RngCore;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors raised while materializing a working file from the seed corpus.
///
/// Every variant is fatal for the run: an empty corpus leaves nothing to fuzz,
/// and an unreadable seed or unwritable working file points at a filesystem
/// problem that retrying will not fix.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// No seed files were registered before the run started.
    #[error("Corpus is empty, cannot select a seed")]
    CorpusIsEmpty,

    /// The selected seed could not be opened or read.
    #[error("Failed to read seed file {path:?}: {source}")]
    SeedUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The working copy could not be created or written.
    #[error("Failed to write working file {path:?}: {source}")]
    WorkingFileUnwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The scratch file a test case runs against, plus the seed it was copied from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingFile {
    path: PathBuf,
    seed: PathBuf,
}

impl WorkingFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The seed this working file was derived from.
    pub fn seed(&self) -> &Path {
        &self.seed
    }
}

/// An ordered set of seed file paths and the location of the working file
/// that test cases are materialized into.
///
/// Seeds are registered before fuzzing starts and are never modified; every
/// selection copies the chosen seed over the same working path (one per file
/// extension, since targets commonly dispatch on it).
#[derive(Debug, Clone)]
pub struct SeedCorpus {
    seeds: Vec<PathBuf>,
    working_dir: PathBuf,
    working_file_stem: String,
}

impl SeedCorpus {
    pub fn new(working_dir: impl Into<PathBuf>, working_file_stem: impl Into<String>) -> Self {
        Self {
            seeds: Vec::new(),
            working_dir: working_dir.into(),
            working_file_stem: working_file_stem.into(),
        }
    }

    /// Registers a seed file. Existence is not checked until the seed is selected.
    pub fn add_seed(&mut self, path: impl Into<PathBuf>) {
        self.seeds.push(path.into());
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    /// Working-file path for `seed`: `<working_dir>/<stem>.<seed extension>`.
    /// A seed without an extension yields a working file without one.
    pub fn working_path_for(&self, seed: &Path) -> PathBuf {
        let mut name = OsString::from(&self.working_file_stem);
        if let Some(ext) = seed.extension() {
            name.push(".");
            name.push(ext);
        }
        self.working_dir.join(name)
    }

    /// Picks a seed uniformly at random and copies it byte-for-byte over the
    /// working file, returning the working file's location.
    pub fn select(
        &self,
        rng: &mut dyn RngCore,
        trace: &mut CaseTrace,
    ) -> Result<WorkingFile, CorpusError> {
        if self.seeds.is_empty() {
            return Err(CorpusError::CorpusIsEmpty);
        }
        let seed = &self.seeds[rng.random_range(0..self.seeds.len())];
        trace.push(format!("Deriving test case from '{}'.", seed.display()));

        let bytes = fs::read(seed).map_err(|source| CorpusError::SeedUnreadable {
            path: seed.clone(),
            source,
        })?;

        let working_path = self.working_path_for(seed);
        fs::write(&working_path, &bytes).map_err(|source| CorpusError::WorkingFileUnwritable {
            path: working_path.clone(),
            source,
        })?;
        debug!(
            seed = %seed.display(),
            working_file = %working_path.display(),
            bytes = bytes.len(),
            "Materialized working file"
        );

        Ok(WorkingFile {
            path: working_path,
            seed: seed.clone(),
        })
    }
}
