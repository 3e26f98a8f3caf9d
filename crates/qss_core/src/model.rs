//! Time-tagged polynomial models.
//!
//! A model of maximum order `n` represents
//! `p(t) = c[0] + c[1]*(t - t_model) + ... + c[n]*(t - t_model)^n`,
//! so `c[1]` is the slope and `c[2]` half the second derivative at `t_model`.

use crate::time::Time;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Handle for a model shared between one writer and any number of readers.
pub type SharedModel = Rc<RefCell<ModelPolynomial>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelPolynomial {
    coeffs: Vec<f64>,
    t_model: Option<Time>,
    writers: usize,
}

impl ModelPolynomial {
    pub fn new(max_order: usize) -> Self {
        Self {
            coeffs: vec![0.0; max_order + 1],
            t_model: None,
            writers: 0,
        }
    }

    /// Builds a constant model tagged at `time`.
    pub fn constant(max_order: usize, value: f64, time: Time) -> Self {
        let mut model = Self::new(max_order);
        model.make_constant(value, time);
        model
    }

    /// Wraps a model into a shared handle that already carries one write claim.
    pub fn into_shared(mut self) -> SharedModel {
        self.claim_write_access();
        Rc::new(RefCell::new(self))
    }

    pub fn max_order(&self) -> usize {
        self.coeffs.len() - 1
    }

    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    pub fn coeffs_mut(&mut self) -> &mut [f64] {
        &mut self.coeffs
    }

    pub fn time(&self) -> Option<Time> {
        self.t_model
    }

    pub fn set_time(&mut self, time: Time) {
        self.t_model = Some(time);
    }

    /// Overwrites the model with the constant `value` tagged at `time`.
    pub fn make_constant(&mut self, value: f64, time: Time) {
        self.coeffs.fill(0.0);
        self.coeffs[0] = value;
        self.t_model = Some(time);
    }

    /// Offset of `time` from the model's tag. An untagged model treats every
    /// time as its own tag.
    pub fn offset(&self, time: Time) -> f64 {
        match self.t_model {
            Some(tag) => time.subtract_to_f64(tag),
            None => 0.0,
        }
    }

    pub fn evaluate(&self, time: Time) -> f64 {
        self.evaluate_at_offset(self.offset(time))
    }

    pub fn evaluate_at_offset(&self, dt: f64) -> f64 {
        let mut value = 0.0;
        for &c in self.coeffs.iter().rev() {
            value = value * dt + c;
        }
        value
    }

    /// First derivative with respect to time.
    pub fn evaluate_derivative(&self, time: Time) -> f64 {
        self.evaluate_derivative_at_offset(self.offset(time))
    }

    pub fn evaluate_derivative_at_offset(&self, dt: f64) -> f64 {
        let mut value = 0.0;
        for (k, &c) in self.coeffs.iter().enumerate().skip(1).rev() {
            value = value * dt + (k as f64) * c;
        }
        value
    }

    /// Second derivative with respect to time.
    pub fn evaluate_derivative2(&self, time: Time) -> f64 {
        self.evaluate_derivative2_at_offset(self.offset(time))
    }

    pub fn evaluate_derivative2_at_offset(&self, dt: f64) -> f64 {
        let mut value = 0.0;
        for (k, &c) in self.coeffs.iter().enumerate().skip(2).rev() {
            value = value * dt + ((k * (k - 1)) as f64) * c;
        }
        value
    }

    /// Writes the coefficients of this polynomial re-centered at `time` into
    /// `out`. Only the first `out.len()` coefficients are produced; missing
    /// higher-order terms are zero.
    pub fn coefficients_at(&self, time: Time, out: &mut [f64]) {
        let shift = self.offset(time);
        let n = self.coeffs.len();
        if n > STACK_COEFFS {
            let mut work = self.coeffs.clone();
            taylor_shift(&mut work, shift);
            copy_truncated(&work, out);
            return;
        }
        let mut work = [0.0_f64; STACK_COEFFS];
        work[..n].copy_from_slice(&self.coeffs);
        taylor_shift(&mut work[..n], shift);
        copy_truncated(&work[..n], out);
    }

    pub fn claim_write_access(&mut self) {
        self.writers += 1;
    }

    pub fn release_write_access(&mut self) {
        self.writers = self.writers.saturating_sub(1);
    }

    pub fn writer_count(&self) -> usize {
        self.writers
    }
}

const STACK_COEFFS: usize = 8;

fn copy_truncated(src: &[f64], out: &mut [f64]) {
    for (k, slot) in out.iter_mut().enumerate() {
        *slot = src.get(k).copied().unwrap_or(0.0);
    }
}

/// Re-expands `coeffs` (in powers of `tau`) in powers of `tau - shift` by
/// repeated synthetic division.
fn taylor_shift(coeffs: &mut [f64], shift: f64) {
    let order = coeffs.len().saturating_sub(1);
    if shift == 0.0 {
        return;
    }
    for i in 0..order {
        for j in (i..order).rev() {
            coeffs[j] += shift * coeffs[j + 1];
        }
    }
}

impl fmt::Display for ModelPolynomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.t_model {
            Some(tag) => write!(f, "t_model={tag} coeffs={:?}", self.coeffs),
            None => write!(f, "t_model=unset coeffs={:?}", self.coeffs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn time(value: f64) -> Time {
        Time::new(value).expect("time")
    }

    #[test]
    fn evaluates_value_and_derivatives() {
        let mut model = ModelPolynomial::new(3);
        model.coeffs_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        model.set_time(time(1.0));

        let t = time(3.0);
        // dt = 2
        assert_eq!(model.evaluate(t), 1.0 + 4.0 + 12.0 + 32.0);
        assert_eq!(model.evaluate_derivative(t), 2.0 + 12.0 + 48.0);
        assert_eq!(model.evaluate_derivative2(t), 6.0 + 48.0);
        assert_eq!(model.evaluate(time(1.0)), 1.0);
    }

    #[test]
    fn untagged_model_evaluates_constant_term() {
        let mut model = ModelPolynomial::new(1);
        model.coeffs_mut()[0] = 5.0;
        model.coeffs_mut()[1] = 100.0;
        assert_eq!(model.evaluate(time(10.0)), 5.0);
    }

    #[test]
    fn make_constant_clears_history() {
        let mut model = ModelPolynomial::new(2);
        model.coeffs_mut().copy_from_slice(&[1.0, 2.0, 3.0]);
        model.make_constant(7.5, time(2.0));
        assert_eq!(model.coeffs(), &[7.5, 0.0, 0.0]);
        assert_eq!(model.time(), Some(time(2.0)));
        assert_eq!(model.evaluate(time(50.0)), 7.5);
    }

    #[test]
    fn writer_claims_are_counted() {
        let shared = ModelPolynomial::constant(0, 1.0, Time::ZERO).into_shared();
        assert_eq!(shared.borrow().writer_count(), 1);
        shared.borrow_mut().claim_write_access();
        assert_eq!(shared.borrow().writer_count(), 2);
        shared.borrow_mut().release_write_access();
        shared.borrow_mut().release_write_access();
        shared.borrow_mut().release_write_access();
        assert_eq!(shared.borrow().writer_count(), 0);
    }

    #[test]
    fn display_reports_tag_and_coefficients() {
        let model = ModelPolynomial::constant(1, 2.0, time(0.5));
        assert_eq!(model.to_string(), "t_model=0.5 coeffs=[2.0, 0.0]");
        assert!(ModelPolynomial::new(0).to_string().contains("unset"));
    }

    proptest! {
        #[test]
        fn recentered_coefficients_describe_the_same_polynomial(
            coeffs in prop::array::uniform4(-10.0f64..10.0),
            tag in -5.0f64..5.0,
            center in -5.0f64..5.0,
            at in -5.0f64..5.0,
        ) {
            let mut model = ModelPolynomial::new(3);
            model.coeffs_mut().copy_from_slice(&coeffs);
            model.set_time(time(tag));

            let mut shifted = [0.0; 4];
            model.coefficients_at(time(center), &mut shifted);
            let mut recentered = ModelPolynomial::new(3);
            recentered.coeffs_mut().copy_from_slice(&shifted);
            recentered.set_time(time(center));

            let expected = model.evaluate(time(at));
            let actual = recentered.evaluate(time(at));
            prop_assert!((expected - actual).abs() <= 1e-7 * (1.0 + expected.abs()));
            prop_assert!((shifted[0] - model.evaluate(time(center))).abs() <= 1e-8 * (1.0 + shifted[0].abs()));
        }
    }
}
