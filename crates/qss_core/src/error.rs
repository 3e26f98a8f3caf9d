//! Error types for the QSS engine and its collaborators.

use thiserror::Error;

/// Failure reported by a derivative function.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DerivativeError {
    #[error("derivative function returned status {status}")]
    Status { status: i32 },

    #[error("derivative {index} evaluated to a non-finite value ({value})")]
    NonFinite { index: usize, value: f64 },

    #[error("derivative function does not supply sampled derivatives")]
    SamplingUnsupported,

    #[error("{0}")]
    Evaluation(String),
}

/// Errors raised by the integration engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QssError {
    #[error("Invalid argument: {what}")]
    InvalidArg { what: String },

    #[error("Derivative function can be bound only once")]
    DerivativeFunctionAlreadyBound,

    #[error("Must bind a derivative function first")]
    DerivativeFunctionNotBound,

    #[error("Initial time can be set only once")]
    InitialTimeAlreadySet,

    #[error("Must set the initial simulation time first")]
    InitialTimeNotSet,

    #[error("Require absolute tolerance > 0 and relative tolerance >= 0; got {absolute} and {relative}")]
    InvalidTolerance { absolute: f64, relative: f64 },

    #[error("State index {index} out of range for {count} states")]
    StateIndex { index: usize, count: usize },

    #[error("Input variable index {index} out of range for {count} input variables")]
    InputIndex { index: usize, count: usize },

    #[error("Need model for input variable {index}")]
    MissingInputModel { index: usize },

    #[error("Need initial value for state {index}")]
    MissingInitialValue { index: usize },

    #[error("Simulation time must advance: current {current}, requested {requested}")]
    TimeMustAdvance { current: f64, requested: f64 },

    #[error("State model {index} waiting to be quantized")]
    PendingQuantization { index: usize },

    #[error("Proposed simulation time {requested} is past the next event time {predicted}")]
    PastPredictedEvent { requested: f64, predicted: f64 },

    #[error("Invalid time arithmetic: {what}")]
    InvalidTime { what: String },

    #[error("Derivative evaluation failed at time {time}: {source}")]
    Derivative {
        time: f64,
        #[source]
        source: DerivativeError,
    },

    #[error("Engine not ready: {message}")]
    NotReady { message: String },
}

pub type QssResult<T> = Result<T, QssError>;
