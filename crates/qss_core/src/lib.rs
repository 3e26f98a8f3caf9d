//! The `qss_core` crate provides quantized state system (QSS) integrators for
//! event-driven simulation of ordinary differential equations.
//!
//! Instead of stepping time uniformly, each state advances on its own
//! schedule: it is re-quantized whenever its continuous trajectory drifts a
//! quantum away from the quantized value the rest of the system sees.
//!
//! Key components:
//! - **Engine**: `QssEngine`, the event bookkeeping (statuses, quanta, time,
//!   prediction cache) shared by every method.
//! - **Methods**: `QssMethodKind` selects QSS1, QSS3Pts, LIQSS1 or LIQSS2Fd.
//! - **Models**: `ModelPolynomial`, time-tagged Taylor polynomials for states
//!   and input variables.
//! - **Equation Engine**: a bytecode VM for user-typed right-hand sides.
//! - **Simulation**: `simulate`, the driver loop to a stop time.

pub mod engine;
pub mod equation_engine;
pub mod error;
pub mod linear;
pub mod methods;
pub mod model;
pub mod roots;
pub mod settings;
pub mod simulation;
pub mod time;
pub mod traits;

#[cfg(test)]
mod testing;

pub use engine::{PredictionStatus, QssEngine, QuantizationStatus, RateStatus, StateStatus};
pub use equation_engine::EquationSystem;
pub use error::{DerivativeError, QssError, QssResult};
pub use linear::LinearSystem;
pub use methods::QssMethodKind;
pub use model::{ModelPolynomial, SharedModel};
pub use settings::QssSettings;
pub use simulation::{simulate, QuantizationEvent, RunSettings, SimulationResult};
pub use time::Time;
pub use traits::DerivativeFunction;
