//! Delta-time helpers shared by the method prediction workers.
//!
//! Two situations are distinguished:
//!
//! * *Quantized from continuous*: the quantized model was re-formed after the
//!   continuous one, so the two agree in every coefficient the quantized
//!   model carries at the quantized model's tag. The drift is then a single
//!   power of the elapsed time and has a closed form.
//! * *General*: the continuous model was re-formed by a rate event, and the
//!   drift `continuous(h) - quantized(h)` (with `h` measured from the
//!   continuous model's tag) is an arbitrary polynomial whose crossings of
//!   `+dq` and `-dq` are found with the root finder.
//!
//! A returned delta of zero asks for a quantization event as soon as
//! possible; positive infinity means no event is ever needed.

use crate::model::ModelPolynomial;
use crate::roots::{min_positive_root2, min_positive_root3};
use crate::time::Time;
use tracing::trace;

/// Turns a delta from `reference` into an event time that is strictly later
/// than `reference`, or exactly `max`.
pub(crate) fn finalize_event_time(reference: Time, dt: f64, max: Time) -> Time {
    if dt.is_nan() {
        trace!(reference = %reference, "NaN delta-time; using the event time maximum");
        return max;
    }
    let mut dt = dt;
    if dt <= 0.0 {
        dt = reference.ulp();
        trace!(reference = %reference, dt, "non-positive delta-time reset to one ulp");
    }
    loop {
        let candidate = reference.add_unchecked(dt);
        if candidate >= max {
            return max;
        }
        if candidate > reference {
            return candidate;
        }
        trace!(reference = %reference, dt, "delta-time lost to rounding; doubling");
        dt *= 2.0;
    }
}

/// Order 1, quantized from continuous: `|c1| h = dq`.
pub(crate) fn order1_q_from_c(dq: f64, slope: f64) -> f64 {
    if slope == 0.0 {
        f64::INFINITY
    } else {
        dq / slope.abs()
    }
}

/// Order 1, general: `drift + slope*h = ±dq`, where `drift` is the
/// continuous minus quantized value at the continuous model's tag.
pub(crate) fn order1_general(dq: f64, drift: f64, slope: f64) -> f64 {
    if drift.abs() >= dq {
        return 0.0;
    }
    if slope == 0.0 {
        f64::INFINITY
    } else if slope > 0.0 {
        (dq - drift) / slope
    } else {
        (dq + drift) / -slope
    }
}

/// Order 2, quantized from continuous. Falls back to the linear form when
/// the continuous model has no curvature.
pub(crate) fn order2_q_from_c(dq: f64, continuous: &[f64]) -> f64 {
    let curvature = continuous[2];
    if curvature != 0.0 {
        (dq / curvature.abs()).sqrt()
    } else {
        order1_q_from_c(dq, continuous[1])
    }
}

/// Order 2, general, on drift coefficients `[d0, d1, d2]`.
pub(crate) fn order2_general(dq: f64, drift: [f64; 3]) -> f64 {
    let [d0, d1, d2] = drift;
    if d0.abs() >= dq {
        return 0.0;
    }
    if d2 == 0.0 && d1 == 0.0 {
        return f64::INFINITY;
    }
    smaller_crossing(min_positive_root2(d2, d1, d0 + dq), min_positive_root2(d2, d1, d0 - dq))
}

/// Order 3, quantized from continuous. Falls back to the order-2 form when
/// the cubic coefficient vanishes.
pub(crate) fn order3_q_from_c(dq: f64, continuous: &[f64]) -> f64 {
    let cubic = continuous[3];
    if cubic != 0.0 {
        (dq / cubic.abs()).cbrt()
    } else {
        order2_q_from_c(dq, continuous)
    }
}

/// Order 3, general, on drift coefficients `[d0, d1, d2, d3]`.
pub(crate) fn order3_general(dq: f64, drift: [f64; 4], abs_tol: f64, rel_tol: f64) -> f64 {
    let [d0, d1, d2, d3] = drift;
    if d0.abs() >= dq {
        return 0.0;
    }
    if d3 == 0.0 && d2 == 0.0 && d1 == 0.0 {
        return f64::INFINITY;
    }
    smaller_crossing(
        min_positive_root3(d3, d2, d1, d0 + dq, abs_tol, rel_tol),
        min_positive_root3(d3, d2, d1, d0 - dq, abs_tol, rel_tol),
    )
}

/// Coefficients of `continuous(h) - quantized(h)`, with `h` the offset from
/// `tag`, the continuous model's time.
pub(crate) fn drift_coefficients<const N: usize>(
    continuous: &ModelPolynomial,
    quantized: &ModelPolynomial,
    tag: Time,
) -> [f64; N] {
    let mut drift = [0.0; N];
    quantized.coefficients_at(tag, &mut drift);
    for (k, d) in drift.iter_mut().enumerate() {
        let c = continuous.coeffs().get(k).copied().unwrap_or(0.0);
        *d = c - *d;
    }
    drift
}

fn smaller_crossing(up: Option<f64>, down: Option<f64>) -> f64 {
    match (up, down) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => f64::INFINITY,
    }
}
