use crate::engine::EngineState;
use crate::error::{QssError, QssResult};
use crate::time::Time;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod liqss1;
mod liqss2_fd;
pub(crate) mod predict;
mod qss1;
mod qss3_pts;
mod sampling;

pub(crate) use liqss1::Liqss1;
pub(crate) use liqss2_fd::Liqss2Fd;
pub(crate) use qss1::Qss1;
pub(crate) use qss3_pts::Qss3Pts;

/// Selects the numerical method an engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QssMethodKind {
    Qss1,
    Qss3Pts,
    Liqss1,
    Liqss2Fd,
}

impl QssMethodKind {
    pub const ALL: [QssMethodKind; 4] = [
        QssMethodKind::Qss1,
        QssMethodKind::Qss3Pts,
        QssMethodKind::Liqss1,
        QssMethodKind::Liqss2Fd,
    ];

    pub(crate) fn build(self) -> Box<dyn QssMethod> {
        match self {
            QssMethodKind::Qss1 => Box::new(Qss1::default()),
            QssMethodKind::Qss3Pts => Box::new(Qss3Pts::default()),
            QssMethodKind::Liqss1 => Box::new(Liqss1::default()),
            QssMethodKind::Liqss2Fd => Box::new(Liqss2Fd::default()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QssMethodKind::Qss1 => "qss1",
            QssMethodKind::Qss3Pts => "qss3_pts",
            QssMethodKind::Liqss1 => "liqss1",
            QssMethodKind::Liqss2Fd => "liqss2_fd",
        }
    }

    /// Order of the quantized state models the method produces.
    pub fn state_model_order(self) -> usize {
        match self {
            QssMethodKind::Qss1 | QssMethodKind::Liqss1 => 0,
            QssMethodKind::Liqss2Fd => 1,
            QssMethodKind::Qss3Pts => 2,
        }
    }
}

impl fmt::Display for QssMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QssMethodKind {
    type Err = QssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "qss1" => Ok(QssMethodKind::Qss1),
            "qss3_pts" | "qss3pts" | "qss3" => Ok(QssMethodKind::Qss3Pts),
            "liqss1" => Ok(QssMethodKind::Liqss1),
            "liqss2_fd" | "liqss2fd" | "liqss2" => Ok(QssMethodKind::Liqss2Fd),
            other => Err(QssError::InvalidArg {
                what: format!("unknown QSS method '{other}'"),
            }),
        }
    }
}

/// The numerically specific half of a QSS integrator. The engine keeps the
/// bookkeeping and calls into the method for everything else.
pub(crate) trait QssMethod {
    fn name(&self) -> &'static str;

    fn state_model_order(&self) -> usize;

    /// Sizes per-state storage. Called once, when the derivative function
    /// is bound.
    fn allocate(&mut self, state_count: usize);

    /// Forgets per-state history after the state was set outright.
    fn reset_state(&mut self, _index: usize) {}

    /// Re-forms quantized model `index` at `now`. The engine refreshes the
    /// quantum afterwards.
    fn trigger_quantization_event(&mut self, state: &mut EngineState, index: usize, now: Time);

    /// Re-forms every continuous model at `now`.
    fn trigger_rate_event(&mut self, state: &mut EngineState, now: Time) -> QssResult<()>;

    /// Next time quantized model `index` drifts a quantum away from its
    /// continuous model, capped at `max`.
    fn predict_quantization_event_time(&self, state: &EngineState, index: usize, max: Time) -> Time;
}
