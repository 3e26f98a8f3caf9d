//! Event-loop driver that runs an engine to a stop time.

use crate::engine::QssEngine;
use crate::time::Time;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Upper bound on quantization events before the run is abandoned.
    pub max_events: usize,
    /// Whether individual quantization events are kept in the result.
    pub record_events: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_events: 1_000_000,
            record_events: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuantizationEvent {
    pub time: f64,
    pub state: usize,
    /// Quantized value right after the event.
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationResult {
    pub events: Vec<QuantizationEvent>,
    pub event_counts: Vec<usize>,
    pub rate_events: usize,
    pub final_time: f64,
    /// Continuous state values at `final_time`.
    pub final_states: Vec<f64>,
}

impl SimulationResult {
    pub fn total_events(&self) -> usize {
        self.event_counts.iter().sum()
    }
}

/// Runs `engine` from its current time to `stop_time`.
///
/// Each cycle quantizes every due state, triggers a pending rate event, then
/// steps to the earlier of the next predicted quantization event and
/// `stop_time`. States due at `stop_time` itself are quantized before return.
pub fn simulate(engine: &mut QssEngine, stop_time: f64, settings: &RunSettings) -> Result<SimulationResult> {
    if let Some(message) = engine.validate() {
        bail!("Engine not ready: {message}");
    }
    let stop = Time::new(stop_time).context("Invalid stop time")?;
    let start = engine
        .current_time()
        .ok_or_else(|| anyhow!("Must set the initial simulation time first"))?;
    if stop <= start {
        bail!("Stop time {stop} must be after the current time {start}");
    }

    let mut result = SimulationResult {
        event_counts: vec![0; engine.state_count()],
        ..SimulationResult::default()
    };
    let mut total = 0usize;

    loop {
        let now = engine
            .current_time()
            .ok_or_else(|| anyhow!("Simulation time was cleared"))?;
        let quantized = engine.trigger_quantization_events(false)?;
        total += quantized.len();
        if total > settings.max_events {
            warn!(
                max_events = settings.max_events,
                time = %now,
                "event budget exhausted"
            );
            bail!(
                "Exceeded {} quantization events before reaching t = {}; stopped at t = {}",
                settings.max_events,
                stop,
                now
            );
        }
        for index in quantized {
            result.event_counts[index] += 1;
            if settings.record_events {
                result.events.push(QuantizationEvent {
                    time: now.value(),
                    state: index,
                    value: engine.evaluate_state_model(index, now)?,
                });
            }
        }

        if engine.needs_rate_event() {
            engine.trigger_rate_event()?;
            result.rate_events += 1;
        }
        if now >= stop {
            break;
        }

        // Predictions clamp to the quantization-event time maximum, so once
        // `now` reaches it nothing can come due before `stop`.
        let mut next = engine.predict_earliest_quantization_event_time()?.min(stop);
        if next <= now {
            next = stop;
        }
        engine.step_to_time(next)?;
    }

    result.final_time = stop.value();
    result.final_states = (0..engine.state_count())
        .map(|index| engine.evaluate_continuous_state_model(index, stop))
        .collect::<Result<_, _>>()?;
    debug!(
        stop = %stop,
        events = total,
        rate_events = result.rate_events,
        "simulation finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::QssMethodKind;
    use crate::testing::{assert_err_contains, t, ClosureSystem};

    fn ramp_engine(kind: QssMethodKind) -> QssEngine {
        let mut engine = QssEngine::new(kind);
        engine
            .bind_derivative_function(ClosureSystem::new(1, |_, _, _, dx| dx[0] = 1.0))
            .expect("bind");
        engine.set_initial_time(t(0.0)).expect("initial time");
        engine.set_quantum_tolerances(0.25, 0.0).expect("tolerances");
        engine.set_state_value(0, 0.0).expect("state value");
        engine
    }

    #[test]
    fn records_every_quantization_event() {
        let mut engine = ramp_engine(QssMethodKind::Qss1);
        let result = simulate(&mut engine, 1.0, &RunSettings::default()).expect("simulate");

        // Initial quantization plus one per quarter unit.
        assert_eq!(result.event_counts, vec![5]);
        assert_eq!(result.events.len(), 5);
        let times: Vec<f64> = result.events.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(result.events[2].value, 0.5);
        assert_eq!(result.final_time, 1.0);
        assert!((result.final_states[0] - 1.0).abs() < 1e-12);
        assert_eq!(result.rate_events, 5);
        assert_eq!(engine.current_time(), Some(t(1.0)));
    }

    #[test]
    fn can_skip_event_recording() {
        let mut engine = ramp_engine(QssMethodKind::Liqss1);
        let settings = RunSettings {
            record_events: false,
            ..RunSettings::default()
        };
        let result = simulate(&mut engine, 1.0, &settings).expect("simulate");
        assert!(result.events.is_empty());
        assert_eq!(result.total_events(), 5);
    }

    #[test]
    fn enforces_the_event_budget() {
        let mut engine = ramp_engine(QssMethodKind::Qss1);
        let settings = RunSettings {
            max_events: 3,
            ..RunSettings::default()
        };
        assert_err_contains(simulate(&mut engine, 10.0, &settings), "Exceeded 3 quantization events");
    }

    #[test]
    fn rejects_unready_engines_and_bad_stop_times() {
        let mut engine = QssEngine::new(QssMethodKind::Qss1);
        engine
            .bind_derivative_function(ClosureSystem::new(1, |_, _, _, dx| dx[0] = 1.0))
            .expect("bind");
        engine.set_initial_time(t(0.0)).expect("initial time");
        assert_err_contains(
            simulate(&mut engine, 1.0, &RunSettings::default()),
            "Need initial value for state 0",
        );

        let mut engine = ramp_engine(QssMethodKind::Qss1);
        assert_err_contains(simulate(&mut engine, 0.0, &RunSettings::default()), "must be after");
        assert_err_contains(simulate(&mut engine, f64::NAN, &RunSettings::default()), "Invalid stop time");
    }

    #[test]
    fn continues_from_a_previous_run() {
        let mut engine = ramp_engine(QssMethodKind::Qss3Pts);
        simulate(&mut engine, 1.0, &RunSettings::default()).expect("first leg");
        let result = simulate(&mut engine, 2.0, &RunSettings::default()).expect("second leg");
        assert!((result.final_states[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn runs_past_the_quantization_event_time_maximum() {
        let mut engine = QssEngine::new(QssMethodKind::Qss1);
        engine
            .initialize(ClosureSystem::new(1, |_, _, _, dx| dx[0] = 1.0), t(0.0), t(1.0), 0)
            .expect("initialize");
        engine.set_quantum_tolerances(0.25, 0.0).expect("tolerances");

        let result = simulate(&mut engine, 2.0, &RunSettings::default()).expect("simulate");
        assert_eq!(engine.current_time(), Some(t(2.0)));
        assert!((result.final_states[0] - 2.0).abs() < 1e-12);
        let last = result.events.last().expect("events");
        assert_eq!(last.time, 2.0);
    }

    #[test]
    fn run_settings_deserialize_with_defaults() {
        let settings: RunSettings = serde_json::from_str(r#"{"max_events": 10}"#).expect("deserialize");
        assert_eq!(settings.max_events, 10);
        assert!(settings.record_events);
    }

    #[test]
    fn result_serializes_to_json() {
        let mut engine = ramp_engine(QssMethodKind::Qss1);
        let result = simulate(&mut engine, 0.5, &RunSettings::default()).expect("simulate");
        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["event_counts"], serde_json::json!([3]));
        assert_eq!(json["events"][1]["time"], serde_json::json!(0.25));
    }
}
