//! Persisted run state.
//!
//! One directory per run:
//!
//! ```text
//! <run_dir>/config.json     effective RunConfig
//! <run_dir>/ledger.json     CoverageLedger, rewritten before every case file
//! <run_dir>/events.jsonl    one EventRecord per line
//! <run_dir>/cases/<id>.json one TestCase per committed case
//! ```
//!
//! Case and ledger files are written to a temporary name and renamed, so a
//! killed run never leaves a half-written record behind.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use concolic_explore::ledger::CoverageLedger;
use concolic_explore::testcase::TestCase;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::events::{EventRecord, RunEvent};

pub const CASES_DIR: &str = "cases";
pub const LEDGER_FILE: &str = "ledger.json";
pub const CONFIG_FILE: &str = "config.json";
pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Bad JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Run directory {0} already holds cases; resume it instead")]
    NotEmpty(PathBuf),

    #[error("{0} is not a run directory")]
    NotARun(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug)]
pub struct RunStore {
    dir: PathBuf,
    events: Mutex<File>,
}

impl RunStore {
    /// Start a fresh run directory. Refuses a directory that already holds cases.
    pub fn create(dir: &Path) -> Result<Self, StoreError> {
        let cases = dir.join(CASES_DIR);
        if cases.is_dir() {
            let mut entries = fs::read_dir(&cases).map_err(io_err(&cases))?;
            if entries.next().is_some() {
                return Err(StoreError::NotEmpty(dir.to_path_buf()));
            }
        }
        fs::create_dir_all(&cases).map_err(io_err(&cases))?;
        Self::open_events(dir)
    }

    /// Open an existing run directory for resume or replay.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        if !dir.join(CASES_DIR).is_dir() {
            return Err(StoreError::NotARun(dir.to_path_buf()));
        }
        Self::open_events(dir)
    }

    fn open_events(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(EVENTS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            events: Mutex::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn case_path(&self, case: &TestCase) -> PathBuf {
        self.dir.join(CASES_DIR).join(format!("{}.json", case.id.0))
    }

    pub fn save_case(&self, case: &TestCase) -> Result<(), StoreError> {
        let path = self.case_path(case);
        write_json_atomic(&path, case)?;
        debug!(case_id = %case.id, path = %path.display(), "case saved");
        Ok(())
    }

    /// Every persisted case, sorted by id.
    pub fn load_cases(&self) -> Result<Vec<TestCase>, StoreError> {
        let dir = self.dir.join(CASES_DIR);
        let mut cases = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let path = entry.map_err(io_err(&dir))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            cases.push(read_json::<TestCase>(&path)?);
        }
        cases.sort_by_key(|c| c.id);
        Ok(cases)
    }

    pub fn save_ledger(&self, ledger: &CoverageLedger) -> Result<(), StoreError> {
        write_json_atomic(&self.dir.join(LEDGER_FILE), ledger)
    }

    /// The persisted ledger, or `None` if the directory has none.
    pub fn load_ledger(&self) -> Result<Option<CoverageLedger>, StoreError> {
        let path = self.dir.join(LEDGER_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn save_config(&self, config: &RunConfig) -> Result<(), StoreError> {
        write_json_atomic(&self.dir.join(CONFIG_FILE), config)
    }

    pub fn load_config(&self) -> Result<Option<RunConfig>, StoreError> {
        let path = self.dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn append_event(&self, elapsed_ms: u64, event: RunEvent) -> Result<(), StoreError> {
        let path = self.dir.join(EVENTS_FILE);
        let record = EventRecord { elapsed_ms, event };
        let mut line = serde_json::to_string(&record).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        line.push('\n');
        let mut file = self.events.lock();
        file.write_all(line.as_bytes()).map_err(io_err(&path))?;
        file.flush().map_err(io_err(&path))
    }

    /// Every event in the log. A torn final line (killed mid-write) is skipped.
    pub fn read_events(&self) -> Result<Vec<EventRecord>, StoreError> {
        let path = self.dir.join(EVENTS_FILE);
        let text = fs::read_to_string(&path).map_err(io_err(&path))?;
        let mut events = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => events.push(record),
                Err(err) => warn!(line = idx + 1, error = %err, "skipping unreadable event"),
            }
        }
        Ok(events)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let text = fs::read_to_string(path).map_err(io_err(path))?;
    serde_json::from_str(&text).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}
