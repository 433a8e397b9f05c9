use crate::recorder::CaseTrace;
use rand::Rng;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that make a single test case unusable. The orchestrator skips the
/// case and moves on; none of these abort the run.
#[derive(Error, Debug)]
pub enum MutationError {
    #[error("Failed to open {path:?} for reading: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path:?} is empty, there are no bits to flip")]
    EmptyInput { path: PathBuf },

    #[error("{path:?} is {len} bytes, too large to load into memory")]
    TooLarge { path: PathBuf, len: u64 },

    #[error("Failed to write mutated bytes to {path:?}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a mutation pass did to a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReport {
    /// Length of the file in bytes, as declared by its metadata.
    pub len: usize,
    /// Bit positions flipped, in order. Positions may repeat.
    pub flipped_bits: Vec<u64>,
    /// Bytes actually read when the read came up short of `len`.
    pub short_read: Option<usize>,
}

impl MutationReport {
    pub fn flip_count(&self) -> usize {
        self.flipped_bits.len()
    }
}

/// A `Mutator` corrupts a file in place to produce the next test case.
///
/// # Type Parameters
/// * `R`: The random number generator driving mutation decisions.
pub trait Mutator<R: Rng + ?Sized> {
    /// Mutates the file at `path` in place, narrating what it did into `trace`.
    fn mutate(
        &mut self,
        path: &Path,
        rng: &mut R,
        trace: &mut CaseTrace,
    ) -> Result<MutationReport, MutationError>;
}

/// Flips between 1 and `max_bits_to_flip` randomly chosen bits of a file.
///
/// The flip count is drawn uniformly from `[1, max_bits_to_flip]`, and each
/// flip picks its position independently over the whole file, so two flips
/// can land on the same bit and cancel out.
#[derive(Debug, Clone, Copy)]
pub struct BitFlipMutator {
    max_bits_to_flip: u32,
}

impl BitFlipMutator {
    /// A zero bound is raised to one so every pass flips at least one bit.
    pub fn new(max_bits_to_flip: u32) -> Self {
        Self {
            max_bits_to_flip: max_bits_to_flip.max(1),
        }
    }

    pub fn max_bits_to_flip(&self) -> u32 {
        self.max_bits_to_flip
    }
}

impl<R: Rng + ?Sized> Mutator<R> for BitFlipMutator {
    fn mutate(
        &mut self,
        path: &Path,
        rng: &mut R,
        trace: &mut CaseTrace,
    ) -> Result<MutationReport, MutationError> {
        let bits_to_flip = rng.random_range(1..=self.max_bits_to_flip);
        info!("Flipping {bits_to_flip} bits.");
        trace.push(format!("Flipping {bits_to_flip} bits."));

        let loaded = load_file(path)?;
        if let Some(read) = loaded.short_read {
            warn!(
                path = %path.display(),
                read,
                len = loaded.buffer.len(),
                "Short read, flipping over the full declared length"
            );
            trace.push(format!(
                "Failed to read entire contents of input file ({} of {} bytes read).",
                read,
                loaded.buffer.len()
            ));
        }

        let mut buffer = loaded.buffer;
        let flipped_bits = flip_random_bits(&mut buffer, bits_to_flip, rng);
        for bit in &flipped_bits {
            debug!("Flipping bit {bit}");
            trace.push(format!("    Flipping bit {bit}"));
        }

        fs::write(path, &buffer).map_err(|source| MutationError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(MutationReport {
            len: buffer.len(),
            flipped_bits,
            short_read: loaded.short_read,
        })
    }
}

struct LoadedFile {
    buffer: Vec<u8>,
    short_read: Option<usize>,
}

/// Reads a file into a buffer sized from its metadata. A read that stops early
/// leaves the rest of the buffer zeroed and is reported rather than failed.
fn load_file(path: &Path) -> Result<LoadedFile, MutationError> {
    let unreadable = |source: io::Error| MutationError::Unreadable {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(unreadable)?;
    let declared = file.metadata().map_err(unreadable)?.len();
    if declared == 0 {
        return Err(MutationError::EmptyInput {
            path: path.to_path_buf(),
        });
    }
    let len = usize::try_from(declared).map_err(|_| MutationError::TooLarge {
        path: path.to_path_buf(),
        len: declared,
    })?;

    Ok(read_declared(&mut file, len))
}

/// Fills a zeroed buffer of `len` bytes from `reader`. The first error or EOF
/// ends the read; whatever was filled so far is kept.
fn read_declared<T: Read>(reader: &mut T, len: usize) -> LoadedFile {
    let mut buffer = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Read error after {filled} bytes: {e}");
                break;
            }
        }
    }

    LoadedFile {
        buffer,
        short_read: (filled < len).then_some(filled),
    }
}

/// Performs `count` independent single-bit flips over `buffer` and returns the
/// positions in the order they were applied. An empty buffer is left untouched.
pub fn flip_random_bits<R: Rng + ?Sized>(buffer: &mut [u8], count: u32, rng: &mut R) -> Vec<u64> {
    if buffer.is_empty() {
        return Vec::new();
    }
    let total_bits = buffer.len() as u64 * 8;
    (0..count)
        .map(|_| {
            let bit = rng.random_range(0..total_bits);
            flip_bit(buffer, bit);
            bit
        })
        .collect()
}

/// Toggles bit `bit % 8` of byte `bit / 8`. Applying it twice is a no-op.
///
/// # Panics
/// Panics if `bit` is outside `[0, 8 * buffer.len())`.
pub fn flip_bit(buffer: &mut [u8], bit: u64) {
    let byte = (bit / 8) as usize;
    let bit_in_byte = (bit % 8) as u32;
    buffer[byte] ^= 1u8 << bit_in_byte;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;

    fn bits_that_differ(a: &[u8], b: &[u8]) -> HashSet<u64> {
        let mut differing = HashSet::new();
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            let diff = x ^ y;
            for bit in 0..8 {
                if diff & (1 << bit) != 0 {
                    differing.insert(i as u64 * 8 + bit);
                }
            }
        }
        differing
    }

    /// Positions flipped an odd number of times are the ones that should differ.
    fn net_flips(positions: &[u64]) -> HashSet<u64> {
        let mut net = HashSet::new();
        for bit in positions {
            if !net.remove(bit) {
                net.insert(*bit);
            }
        }
        net
    }

    #[test]
    fn flip_bit_toggles_expected_bit() {
        let mut buffer = vec![0u8, 0u8];
        flip_bit(&mut buffer, 0);
        assert_eq!(buffer, vec![0b0000_0001, 0]);
        flip_bit(&mut buffer, 15);
        assert_eq!(buffer, vec![0b0000_0001, 0b1000_0000]);
        flip_bit(&mut buffer, 9);
        assert_eq!(buffer, vec![0b0000_0001, 0b1000_0010]);
    }

    #[test]
    fn flip_bit_is_an_involution() {
        let original: Vec<u8> = vec![0x00, 0xFF, 0x5A, 0xC3];
        for bit in 0..(original.len() as u64 * 8) {
            let mut buffer = original.clone();
            flip_bit(&mut buffer, bit);
            assert_ne!(buffer, original, "Flipping bit {bit} should change the buffer");
            flip_bit(&mut buffer, bit);
            assert_eq!(buffer, original, "Flipping bit {bit} twice should restore it");
        }
    }

    #[test]
    fn flip_random_bits_applies_exactly_count_flips() {
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let original = vec![0xAAu8; 16];
        let mut buffer = original.clone();

        let positions = flip_random_bits(&mut buffer, 40, &mut rng);
        assert_eq!(positions.len(), 40);
        assert!(positions.iter().all(|&bit| bit < 16 * 8));
        assert_eq!(bits_that_differ(&original, &buffer), net_flips(&positions));
    }

    #[test]
    fn flip_random_bits_on_empty_buffer_is_a_noop() {
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        let mut buffer: Vec<u8> = Vec::new();
        assert!(flip_random_bits(&mut buffer, 5, &mut rng).is_empty());
    }

    #[test]
    fn single_bit_budget_changes_exactly_one_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_input.bin");
        let seed = [0x10u8, 0x20, 0x30, 0x40];
        fs::write(&path, seed).unwrap();

        let mut mutator = BitFlipMutator::new(1);
        let mut rng = ChaCha8Rng::from_seed([9; 32]);
        let mut trace = CaseTrace::new();
        let report = mutator.mutate(&path, &mut rng, &mut trace).expect("mutation failed");

        let mutated = fs::read(&path).unwrap();
        assert_eq!(mutated.len(), seed.len());
        assert_eq!(report.flip_count(), 1);
        assert_eq!(bits_that_differ(&seed, &mutated).len(), 1);
        assert_eq!(trace.lines()[0], "Flipping 1 bits.");
        assert_eq!(trace.lines()[1], format!("    Flipping bit {}", report.flipped_bits[0]));
    }

    #[test]
    fn mutated_file_differs_only_at_chosen_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_input.dat");
        let seed: Vec<u8> = (0u8..=63).collect();
        let mut mutator = BitFlipMutator::new(32);
        let mut rng = ChaCha8Rng::from_seed([21; 32]);

        for _ in 0..25 {
            fs::write(&path, &seed).unwrap();
            let mut trace = CaseTrace::new();
            let report = mutator.mutate(&path, &mut rng, &mut trace).expect("mutation failed");
            let mutated = fs::read(&path).unwrap();

            assert_eq!(mutated.len(), seed.len(), "Length must be preserved");
            assert!((1..=32).contains(&report.flip_count()));
            assert_eq!(
                bits_that_differ(&seed, &mutated),
                net_flips(&report.flipped_bits)
            );
        }
    }

    #[test]
    fn flip_count_covers_the_whole_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_input.bin");
        fs::write(&path, [0u8; 8]).unwrap();
        let mut mutator = BitFlipMutator::new(4);
        let mut rng = ChaCha8Rng::from_seed([5; 32]);

        let mut counts = [0usize; 5];
        for _ in 0..400 {
            let mut trace = CaseTrace::new();
            let report = mutator.mutate(&path, &mut rng, &mut trace).expect("mutation failed");
            counts[report.flip_count()] += 1;
        }
        assert_eq!(counts[0], 0, "At least one flip is always performed");
        for (k, seen) in counts.iter().enumerate().skip(1) {
            assert!(
                (50..=150).contains(seen),
                "Flip count {k} seen {seen} times in 400 draws, expected about 100"
            );
        }
    }

    #[test]
    fn empty_file_is_a_mutation_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        fs::write(&path, b"").unwrap();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        let mut trace = CaseTrace::new();

        match BitFlipMutator::new(8).mutate(&path, &mut rng, &mut trace) {
            Err(MutationError::EmptyInput { .. }) => {}
            other => panic!("Expected EmptyInput, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_a_mutation_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        let mut trace = CaseTrace::new();

        match BitFlipMutator::new(8).mutate(&dir.path().join("gone.bin"), &mut rng, &mut trace) {
            Err(MutationError::Unreadable { .. }) => {}
            other => panic!("Expected Unreadable, got {other:?}"),
        }
    }

    /// Hands out at most `chunk` bytes per call, then fails once `fail_after`
    /// bytes have been delivered.
    struct FlakyReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        fail_after: usize,
    }

    impl Read for FlakyReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.fail_after {
                return Err(io::Error::other("device went away"));
            }
            let end = (self.pos + self.chunk)
                .min(self.data.len())
                .min(self.fail_after);
            let n = (end - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn read_declared_zero_fills_after_early_eof() {
        let mut reader: &[u8] = &[1, 2, 3];
        let loaded = read_declared(&mut reader, 8);
        assert_eq!(loaded.buffer, vec![1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(loaded.short_read, Some(3));
    }

    #[test]
    fn read_declared_keeps_bytes_read_before_an_error() {
        let mut reader = FlakyReader {
            data: vec![0xEE; 16],
            pos: 0,
            chunk: 3,
            fail_after: 7,
        };
        let loaded = read_declared(&mut reader, 16);
        assert_eq!(&loaded.buffer[..7], &[0xEE; 7]);
        assert!(loaded.buffer[7..].iter().all(|&b| b == 0));
        assert_eq!(loaded.short_read, Some(7));
    }

    #[test]
    fn read_declared_full_read_is_not_short() {
        let mut reader = FlakyReader {
            data: (0u8..10).collect(),
            pos: 0,
            chunk: 4,
            fail_after: usize::MAX,
        };
        let loaded = read_declared(&mut reader, 10);
        assert_eq!(loaded.buffer, (0u8..10).collect::<Vec<_>>());
        assert_eq!(loaded.short_read, None);
    }

    // A directory opens and reports a size on Unix but every read fails, and
    // writing back to it fails too.
    #[cfg(unix)]
    #[test]
    fn unreadable_contents_flip_over_declared_length_then_fail_to_write() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("not_a_file");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("entry"), b"x").unwrap();
        let declared = fs::metadata(&target).unwrap().len();
        if declared == 0 {
            return;
        }

        let mut rng = ChaCha8Rng::from_seed([4; 32]);
        let mut trace = CaseTrace::new();
        let result = BitFlipMutator::new(16).mutate(&target, &mut rng, &mut trace);

        match result {
            Err(MutationError::WriteFailed { path, .. }) => assert_eq!(path, target),
            other => panic!("Expected WriteFailed, got {other:?}"),
        }
        assert_eq!(
            trace.lines()[1],
            format!("Failed to read entire contents of input file (0 of {declared} bytes read).")
        );
        let flipped: Vec<u64> = trace.lines()[2..]
            .iter()
            .map(|line| {
                line.trim_start()
                    .strip_prefix("Flipping bit ")
                    .and_then(|bit| bit.parse().ok())
                    .unwrap_or_else(|| panic!("Unexpected trace line {line:?}"))
            })
            .collect();
        assert!(!flipped.is_empty());
        assert!(flipped.iter().all(|&bit| bit < declared * 8));
    }

    #[test]
    fn zero_bound_is_raised_to_one() {
        assert_eq!(BitFlipMutator::new(0).max_bits_to_flip(), 1);
    }
}
