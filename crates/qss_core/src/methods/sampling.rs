//! Derivative sampling helpers for the finite-difference rate workers.

use super::predict::finalize_event_time;
use crate::time::Time;

/// Sample time `now + step`, nudged until it is distinct from `now`.
/// Returns the sample time and the offset actually realised.
pub(crate) fn sample_time(now: Time, step: f64) -> (Time, f64) {
    let sample = finalize_event_time(now, step, Time::POSITIVE_INFINITY);
    (sample, sample.subtract_to_f64(now))
}

/// Fits `f(h) = f0 + b*h + c*h^2` through `(0, f0)`, `(h1, f1)` and
/// `(h2, f2)`, returning `(b, c)`. Requires `0 < h1 < h2`.
pub(crate) fn fit_quadratic(f0: f64, h1: f64, f1: f64, h2: f64, f2: f64) -> (f64, f64) {
    let s1 = (f1 - f0) / h1;
    let s2 = (f2 - f0) / h2;
    let c = (s2 - s1) / (h2 - h1);
    (s1 - c * h1, c)
}
