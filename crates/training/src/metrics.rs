//! Step counters, per-epoch loss meters and the JSONL scalar sink.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};

pub const SCALARS_FILE: &str = "scalars.jsonl";

pub mod tags {
    pub const LOSS_BG: &str = "loss/lr_bg";
    pub const LOSS_FG: &str = "loss/loss_fg";
    pub const LOSS_RECON: &str = "loss/loss_recon";
    pub const LOSS_COST: &str = "loss/loss_cost";
    pub const LOSS_CVAE: &str = "loss/loss_cvae";
    pub const LOSS_TOTAL: &str = "loss/loss_cost+cvae";
}

/// Global step counters for the detector cost and the CVAE loss streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounters {
    pub main: u64,
    pub cvae: u64,
}

impl StepCounters {
    pub fn advance_main(&mut self) -> u64 {
        self.main += 1;
        self.main
    }

    pub fn advance_cvae(&mut self) -> u64 {
        self.cvae += 1;
        self.cvae
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Train,
    Val,
}

impl RunMode {
    pub fn prefix(&self) -> &'static str {
        match self {
            RunMode::Train => "Train",
            RunMode::Val => "Val",
        }
    }
}

/// Host-side loss values for one batch (foreground branch terms after weighting).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchLosses {
    pub loc: f32,
    pub conf: f32,
    pub prop_loc: f32,
    pub prop_conf: f32,
    pub center: f32,
    pub start: f32,
    pub end: f32,
    pub triplet: f32,
    /// Full objective including reconstruction and CVAE terms.
    pub cost: f32,
}

impl BatchLosses {
    fn zip_with(self, other: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        Self {
            loc: f(self.loc, other.loc),
            conf: f(self.conf, other.conf),
            prop_loc: f(self.prop_loc, other.prop_loc),
            prop_conf: f(self.prop_conf, other.prop_conf),
            center: f(self.center, other.center),
            start: f(self.start, other.start),
            end: f(self.end, other.end),
            triplet: f(self.triplet, other.triplet),
            cost: f(self.cost, other.cost),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EpochMeters {
    sums: BatchLosses,
    batches: usize,
}

impl EpochMeters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, batch: &BatchLosses) {
        self.sums = self.sums.zip_with(*batch, |a, b| a + b);
        self.batches += 1;
    }

    /// Means over processed batches; an empty epoch reports zeros.
    pub fn summary(&self, epoch: usize, mode: RunMode) -> EpochSummary {
        let means = if self.batches == 0 {
            tracing::warn!(epoch, mode = mode.prefix(), "epoch processed no batches");
            BatchLosses::default()
        } else {
            let n = self.batches as f32;
            self.sums.zip_with(BatchLosses::default(), |a, _| a / n)
        };
        EpochSummary {
            epoch,
            mode,
            batches: self.batches,
            means,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub mode: RunMode,
    pub batches: usize,
    pub means: BatchLosses,
}

impl fmt::Display for EpochSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.means;
        write!(
            f,
            "Epoch-{} {} Loss: Total - {:.5}, loc - {:.5}, conf - {:.5}, prop_loc - {:.5}, \
             prop_conf - {:.5}, IoU - {:.5}, start - {:.5}, end - {:.5}, Triplet - {:.5}",
            self.epoch,
            self.mode.prefix(),
            m.cost,
            m.loc,
            m.conf,
            m.prop_loc,
            m.prop_conf,
            m.center,
            m.start,
            m.end,
            m.triplet
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRow {
    pub tag: String,
    pub value: f32,
    pub step: u64,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
}

/// Appends scalar rows as JSON lines to `log_dir/scalars.jsonl`.
pub struct ScalarWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl ScalarWriter {
    pub fn open(log_dir: &Path) -> TrainResult<Self> {
        fs::create_dir_all(log_dir).map_err(|e| TrainError::io(log_dir, e))?;
        let path = log_dir.join(SCALARS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrainError::io(&path, e))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn add_scalar(&mut self, tag: &str, value: f32, step: u64) -> TrainResult<()> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let row = ScalarRow {
            tag: tag.to_string(),
            value,
            step,
            wall_time,
        };
        let line = serde_json::to_string(&row)
            .map_err(|e| TrainError::InvalidState(format!("scalar row: {e}")))?;
        writeln!(self.out, "{line}").map_err(|e| TrainError::io(&self.path, e))
    }

    pub fn flush(&mut self) -> TrainResult<()> {
        self.out.flush().map_err(|e| TrainError::io(&self.path, e))
    }
}

/// Read back every row of a scalars file.
pub fn read_scalars(path: &Path) -> TrainResult<Vec<ScalarRow>> {
    let raw = fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str(l).map_err(|e| {
                TrainError::InvalidState(format!("bad scalar row in {}: {e}", path.display()))
            })
        })
        .collect()
}
