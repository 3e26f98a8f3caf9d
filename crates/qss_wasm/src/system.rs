//! Equation-driven QSS system wrapper.

use anyhow::{anyhow, bail, Context, Result};
use qss_core::equation_engine::EquationSystem;
use qss_core::{simulate, QssEngine, QssMethodKind, RunSettings, SharedModel, SimulationResult, Time};
use serde::Deserialize;
use std::fmt::Display;
use wasm_bindgen::prelude::*;

fn to_js(err: impl Display) -> JsValue {
    JsValue::from_str(&err.to_string())
}

fn anyhow_to_js(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}

pub(crate) fn build_engine(
    equations: Vec<String>,
    params: Vec<f64>,
    param_names: &[String],
    var_names: &[String],
    input_names: &[String],
    method: &str,
) -> Result<(QssEngine, Vec<SharedModel>)> {
    let kind: QssMethodKind = method.parse()?;
    let system = EquationSystem::compile(&equations, var_names, input_names, param_names, params)?;
    let mut engine = QssEngine::new(kind);
    let inputs = engine
        .initialize(system, Time::ZERO, Time::POSITIVE_INFINITY, 0)
        .context("Failed to initialize the engine")?;
    Ok((engine, inputs))
}

/// Options object accepted by `configure`; absent keys leave the current
/// setting alone.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct RunOptions {
    max_events: Option<usize>,
    /// `[absolute, relative]`.
    tolerances: Option<(f64, f64)>,
}

#[wasm_bindgen]
pub struct WasmQssSystem {
    engine: QssEngine,
    inputs: Vec<SharedModel>,
    event_counts: Vec<usize>,
    run_settings: RunSettings,
}

impl WasmQssSystem {
    pub(crate) fn from_parts(engine: QssEngine, inputs: Vec<SharedModel>) -> Self {
        let state_count = engine.state_count();
        Self {
            engine,
            inputs,
            event_counts: vec![0; state_count],
            run_settings: RunSettings {
                record_events: false,
                ..RunSettings::default()
            },
        }
    }

    fn now(&self) -> Result<Time> {
        self.engine
            .current_time()
            .ok_or_else(|| anyhow!("Simulation time is not set"))
    }

    pub(crate) fn apply_state(&mut self, state: &[f64]) -> Result<()> {
        if state.len() != self.engine.state_count() {
            bail!(
                "Expected {} state values; got {}",
                self.engine.state_count(),
                state.len()
            );
        }
        for (index, &value) in state.iter().enumerate() {
            self.engine.set_state_value(index, value)?;
        }
        Ok(())
    }

    pub(crate) fn apply_input(&mut self, index: usize, value: f64) -> Result<()> {
        let now = self.now()?;
        let handle = self
            .inputs
            .get(index)
            .ok_or_else(|| anyhow!("Input index {index} out of range for {} inputs", self.inputs.len()))?
            .clone();
        handle
            .try_borrow_mut()
            .map_err(|_| anyhow!("Input variable {index} is being read"))?
            .make_constant(value, now);
        // Rebinding flags the rate event the new input value needs.
        self.engine.bind_input_variable_model(index, Some(handle))?;
        Ok(())
    }

    pub(crate) fn apply_options(&mut self, options: RunOptions) -> Result<()> {
        if let Some((absolute, relative)) = options.tolerances {
            self.engine
                .set_quantum_tolerances(absolute, relative)
                .context("Invalid tolerances")?;
        }
        if let Some(max_events) = options.max_events {
            self.run_settings.max_events = max_events;
        }
        Ok(())
    }

    pub(crate) fn run(&mut self, stop: f64, record_events: bool) -> Result<SimulationResult> {
        let settings = RunSettings {
            record_events,
            ..self.run_settings
        };
        let result = simulate(&mut self.engine, stop, &settings)?;
        for (total, count) in self.event_counts.iter_mut().zip(&result.event_counts) {
            *total += count;
        }
        Ok(result)
    }

    pub(crate) fn state_values(&self) -> Result<Vec<f64>> {
        let now = self.now()?;
        (0..self.engine.state_count())
            .map(|index| Ok(self.engine.evaluate_continuous_state_model(index, now)?))
            .collect()
    }
}

#[wasm_bindgen]
impl WasmQssSystem {
    #[wasm_bindgen(constructor)]
    pub fn new(
        equations: Vec<String>,
        params: Vec<f64>,
        param_names: Vec<String>,
        var_names: Vec<String>,
        input_names: Vec<String>,
        method: &str,
    ) -> Result<WasmQssSystem, JsValue> {
        console_error_panic_hook::set_once();

        let (engine, inputs) = build_engine(
            equations,
            params,
            &param_names,
            &var_names,
            &input_names,
            method,
        )
        .map_err(anyhow_to_js)?;
        Ok(WasmQssSystem::from_parts(engine, inputs))
    }

    pub fn method(&self) -> String {
        self.engine.method_name().to_string()
    }

    pub fn set_state(&mut self, state: &[f64]) -> Result<(), JsValue> {
        self.apply_state(state).map_err(anyhow_to_js)
    }

    pub fn get_state(&self) -> Result<Vec<f64>, JsValue> {
        self.state_values().map_err(anyhow_to_js)
    }

    pub fn set_t(&mut self, t: f64) -> Result<(), JsValue> {
        let time = Time::new(t).map_err(to_js)?;
        self.engine.set_current_simulation_time(time).map_err(to_js)
    }

    pub fn get_t(&self) -> f64 {
        self.engine.current_time().map_or(f64::NAN, Time::value)
    }

    pub fn set_tolerances(&mut self, absolute: f64, relative: f64) -> Result<(), JsValue> {
        self.engine
            .set_quantum_tolerances(absolute, relative)
            .map_err(to_js)
    }

    pub fn set_input(&mut self, index: usize, value: f64) -> Result<(), JsValue> {
        self.apply_input(index, value).map_err(anyhow_to_js)
    }

    pub fn set_max_events(&mut self, max_events: usize) {
        self.run_settings.max_events = max_events;
    }

    /// Applies a `{ maxEvents, tolerances: [absolute, relative] }` object.
    pub fn configure(&mut self, options: JsValue) -> Result<(), JsValue> {
        let options: RunOptions = serde_wasm_bindgen::from_value(options)
            .map_err(|err| JsValue::from_str(&format!("Invalid options: {err}")))?;
        self.apply_options(options).map_err(anyhow_to_js)
    }

    /// Runs to `stop` and returns the serialized simulation result,
    /// including every quantization event.
    pub fn run_until(&mut self, stop: f64) -> Result<JsValue, JsValue> {
        let result = self.run(stop, true).map_err(anyhow_to_js)?;
        serde_wasm_bindgen::to_value(&result)
            .map_err(|err| JsValue::from_str(&format!("Failed to serialize simulation result: {err}")))
    }

    /// Runs to `stop` without recording events and returns the final state.
    pub fn advance(&mut self, stop: f64) -> Result<Vec<f64>, JsValue> {
        let result = self.run(stop, false).map_err(anyhow_to_js)?;
        Ok(result.final_states)
    }

    /// Quantization events per state, summed over every run so far.
    pub fn event_counts(&self) -> Vec<u32> {
        self.event_counts
            .iter()
            .map(|&count| u32::try_from(count).unwrap_or(u32::MAX))
            .collect()
    }
}
