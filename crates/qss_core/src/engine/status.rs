//! Per-state and engine-wide bookkeeping states.

use crate::time::Time;
use serde::Serialize;

/// Whether a state's quantized model must be re-formed before stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QuantizationStatus {
    NeedsEvent,
    Clean,
}

/// Whether a state's predicted quantization-event time is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PredictionStatus {
    Stale,
    Cached(Time),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateStatus {
    pub quantization: QuantizationStatus,
    pub prediction: PredictionStatus,
}

impl StateStatus {
    pub(crate) const INITIAL: StateStatus = StateStatus {
        quantization: QuantizationStatus::NeedsEvent,
        prediction: PredictionStatus::Stale,
    };

    pub fn needs_quantization(&self) -> bool {
        self.quantization == QuantizationStatus::NeedsEvent
    }

    pub fn cached_prediction(&self) -> Option<Time> {
        match self.prediction {
            PredictionStatus::Cached(time) => Some(time),
            PredictionStatus::Stale => None,
        }
    }

    /// Marks the state for re-quantization and drops its cached prediction.
    pub(crate) fn invalidate(&mut self) {
        self.quantization = QuantizationStatus::NeedsEvent;
        self.prediction = PredictionStatus::Stale;
    }
}

/// Whether the continuous models must be re-formed before stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RateStatus {
    NeedsEvent,
    Clean,
}
