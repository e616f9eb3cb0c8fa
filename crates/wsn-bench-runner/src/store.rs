//! Append-only result files, one per parameter tuple.
//!
//! The number of non-empty lines in a tuple's file is its campaign progress.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use wsn_bench_abstract::{ParameterTuple, SampleLineError, TrialResult};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("refusing to persist an incomplete sample for {tuple}")]
    Incomplete { tuple: ParameterTuple },

    #[error("{path}:{line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: SampleLineError,
    },
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn count_lines(text: &str) -> usize {
    text.lines().filter(|l| !l.trim().is_empty()).count()
}

#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    /// Open the store rooted at `dir`, creating the directory if needed.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_at(&dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, tuple: &ParameterTuple) -> PathBuf {
        self.dir.join(tuple.file_name())
    }

    /// Persisted samples for `tuple`; zero when no file exists yet.
    pub fn count(&self, tuple: &ParameterTuple) -> Result<usize, StoreError> {
        let path = self.path_for(tuple);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(count_lines(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(io_at(&path)(e)),
        }
    }

    /// Open `tuple`'s file for appending, dropping any torn final line left by
    /// an interrupted write.
    pub fn open(&self, tuple: &ParameterTuple) -> Result<SampleWriter, StoreError> {
        let path = self.path_for(tuple);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(io_at(&path))?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw).map_err(io_at(&path))?;
        if let Some(&last) = raw.last()
            && last != b'\n'
        {
            let keep = raw.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
            warn!(
                "{}: dropping {} byte(s) of an unterminated line",
                path.display(),
                raw.len() - keep
            );
            file.set_len(keep as u64).map_err(io_at(&path))?;
            raw.truncate(keep);
        }

        let count = count_lines(&String::from_utf8_lossy(&raw));
        debug!("{} holds {} sample(s)", path.display(), count);
        Ok(SampleWriter { file, path, count })
    }

    /// Every sample persisted for `tuple`, in file order.
    pub fn load(&self, tuple: &ParameterTuple) -> Result<Vec<TrialResult>, StoreError> {
        Self::load_file(&self.path_for(tuple))
    }

    /// Every sample in one result file, in file order.
    pub fn load_file(path: &Path) -> Result<Vec<TrialResult>, StoreError> {
        let text = fs::read_to_string(path).map_err(io_at(path))?;
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                TrialResult::from_line(line).map_err(|source| StoreError::Corrupt {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    source,
                })
            })
            .collect()
    }

    /// Result files in the store with the tuple each one holds, sorted by
    /// tuple.
    ///
    /// Legacy separate-response names map to payload 0, so one tuple can
    /// appear twice when both naming schemes are present.
    pub fn tuples(&self) -> Result<Vec<(ParameterTuple, PathBuf)>, StoreError> {
        let mut tuples = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_at(&self.dir))? {
            let entry = entry.map_err(io_at(&self.dir))?;
            let name = entry.file_name();
            match name.to_str().and_then(ParameterTuple::from_file_name) {
                Some(tuple) => tuples.push((tuple, entry.path())),
                None => debug!("Ignoring {:?}", name),
            }
        }
        tuples.sort();
        Ok(tuples)
    }
}

/// Open append handle on one tuple's result file.
#[derive(Debug)]
pub struct SampleWriter {
    file: File,
    path: PathBuf,
    count: usize,
}

impl SampleWriter {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one complete sample as a single line.
    pub fn append(&mut self, tuple: &ParameterTuple, result: &TrialResult) -> Result<(), StoreError> {
        if !result.covers(tuple.nodes()) {
            return Err(StoreError::Incomplete { tuple: *tuple });
        }
        let line = result.to_line();
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .map_err(io_at(&self.path))?;
        self.count += 1;
        Ok(())
    }
}
