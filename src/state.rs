use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted marker of the last run, stored as `{"last_run": "YYYY-MM-DD"}`.
/// Other keys found in the state document are carried through untouched.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Watermark {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Watermark {
    pub fn new(last_run: &str) -> Self {
        Watermark {
            last_run: Some(last_run.to_string()),
            extra: Map::new(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait StateStore {
    /// Reads the watermark left by the previous run, or an empty one.
    fn read(&self) -> Result<Watermark, Error>;

    /// Replaces the persisted watermark.
    fn write(&self, watermark: &Watermark) -> Result<(), Error>;
}

/// State kept in the host data folder: the previous run's state is read from
/// `in/state.json` and the new state is written to `out/state.json`.
pub struct FileStateStore {
    input_path: PathBuf,
    output_path: PathBuf,
}

impl FileStateStore {
    pub fn new(data_dir: &Path) -> Self {
        FileStateStore {
            input_path: data_dir.join("in").join("state.json"),
            output_path: data_dir.join("out").join("state.json"),
        }
    }
}

impl StateStore for FileStateStore {
    fn read(&self) -> Result<Watermark, Error> {
        if !self.input_path.exists() {
            return Ok(Watermark::default());
        }

        let contents = fs::read_to_string(&self.input_path)?;
        if contents.trim().is_empty() {
            return Ok(Watermark::default());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    fn write(&self, watermark: &Watermark) -> Result<(), Error> {
        if let Some(parent) = self.output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.output_path, serde_json::to_string(watermark)?)?;
        Ok(())
    }
}

/// Stamps `today` as the last run, keeping every other key of the current state.
pub fn record_last_run(state: &dyn StateStore, today: &str) -> Result<(), Error> {
    let mut watermark = state.read()?;
    watermark.last_run = Some(today.to_string());
    state.write(&watermark)
}
