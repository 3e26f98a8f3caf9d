//! Smallest positive real roots of low-degree polynomials.
//!
//! Coefficients are given highest power first: `a*x^2 + b*x + c` and
//! `a*x^3 + b*x^2 + c*x + d`. A vanishing leading coefficient degrades the
//! problem to the next lower degree.

const NEWTON_MAX_STEPS: usize = 16;

/// Smallest strictly positive root of `a*x + b`, if any.
pub fn min_positive_root1(a: f64, b: f64) -> Option<f64> {
    if a == 0.0 {
        return None;
    }
    let root = -b / a;
    (root > 0.0 && root.is_finite()).then_some(root)
}

/// Smallest strictly positive real root of `a*x^2 + b*x + c`, if any.
pub fn min_positive_root2(a: f64, b: f64, c: f64) -> Option<f64> {
    if a == 0.0 {
        return min_positive_root1(b, c);
    }
    let disc = b * b - 4.0 * a * c;
    if disc < 0.0 {
        return None;
    }
    // Avoids cancellation between -b and the square root.
    let q = -0.5 * (b + b.signum() * disc.sqrt());
    let mut roots = [f64::NAN; 2];
    roots[0] = q / a;
    if q != 0.0 {
        roots[1] = c / q;
    }
    smallest_positive(&roots)
}

/// Smallest strictly positive real root of `a*x^3 + b*x^2 + c*x + d`, if any.
///
/// Closed-form roots are polished by Newton iteration until a step falls
/// below `abs_tol + rel_tol*|x|`.
pub fn min_positive_root3(a: f64, b: f64, c: f64, d: f64, abs_tol: f64, rel_tol: f64) -> Option<f64> {
    if a == 0.0 {
        return min_positive_root2(b, c, d);
    }
    let mut roots = cubic_real_roots(b / a, c / a, d / a);
    for root in roots.iter_mut().filter(|r| r.is_finite()) {
        *root = polish_cubic_root(*root, a, b, c, d, abs_tol, rel_tol);
    }
    smallest_positive(&roots)
}

fn smallest_positive(roots: &[f64]) -> Option<f64> {
    roots
        .iter()
        .copied()
        .filter(|r| r.is_finite() && *r > 0.0)
        .fold(None, |best, r| match best {
            Some(b) if b <= r => Some(b),
            _ => Some(r),
        })
}

/// Real roots of the monic cubic `x^3 + b*x^2 + c*x + d`. Unused slots are NaN.
fn cubic_real_roots(b: f64, c: f64, d: f64) -> [f64; 3] {
    let shift = b / 3.0;
    // Depressed cubic t^3 + p*t + q with x = t - shift.
    let p = c - b * shift;
    let q = 2.0 * shift * shift * shift - c * shift + d;

    let half_q = 0.5 * q;
    let third_p = p / 3.0;
    let disc = half_q * half_q + third_p * third_p * third_p;

    if disc > 0.0 {
        let sqrt_disc = disc.sqrt();
        let u = (-half_q + sqrt_disc).cbrt();
        let v = (-half_q - sqrt_disc).cbrt();
        [u + v - shift, f64::NAN, f64::NAN]
    } else if third_p == 0.0 {
        // Triple root.
        [-shift, f64::NAN, f64::NAN]
    } else {
        let r = (-third_p).sqrt();
        let cos_arg = (-half_q / (r * r * r)).clamp(-1.0, 1.0);
        let phi = cos_arg.acos();
        let two_pi_third = 2.0 * std::f64::consts::PI / 3.0;
        [
            2.0 * r * (phi / 3.0).cos() - shift,
            2.0 * r * (phi / 3.0 - two_pi_third).cos() - shift,
            2.0 * r * (phi / 3.0 + two_pi_third).cos() - shift,
        ]
    }
}

fn polish_cubic_root(mut x: f64, a: f64, b: f64, c: f64, d: f64, abs_tol: f64, rel_tol: f64) -> f64 {
    for _ in 0..NEWTON_MAX_STEPS {
        let value = ((a * x + b) * x + c) * x + d;
        let slope = (3.0 * a * x + 2.0 * b) * x + c;
        if slope == 0.0 || !value.is_finite() {
            break;
        }
        let step = value / slope;
        if !step.is_finite() {
            break;
        }
        x -= step;
        if step.abs() <= abs_tol + rel_tol * x.abs() {
            break;
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_close(actual: Option<f64>, expected: f64) {
        let value = actual.expect("expected a positive root");
        assert!(
            (value - expected).abs() <= 1e-9 * (1.0 + expected.abs()),
            "expected {expected}, got {value}"
        );
    }

    #[test]
    fn linear_root_requires_positive_solution() {
        assert_close(min_positive_root1(2.0, -4.0), 2.0);
        assert_eq!(min_positive_root1(2.0, 4.0), None);
        assert_eq!(min_positive_root1(0.0, 1.0), None);
    }

    #[test]
    fn quadratic_picks_smallest_positive_root() {
        // (x - 1)(x - 3)
        assert_close(min_positive_root2(1.0, -4.0, 3.0), 1.0);
        // (x + 1)(x - 3)
        assert_close(min_positive_root2(1.0, -2.0, -3.0), 3.0);
        // x^2 + 1 has no real roots.
        assert_eq!(min_positive_root2(1.0, 0.0, 1.0), None);
        // Both roots negative.
        assert_eq!(min_positive_root2(1.0, 3.0, 2.0), None);
    }

    #[test]
    fn quadratic_degrades_to_linear() {
        assert_close(min_positive_root2(0.0, -2.0, 1.0), 0.5);
        assert_eq!(min_positive_root2(0.0, 0.0, 1.0), None);
    }

    #[test]
    fn quadratic_handles_tiny_roots_without_cancellation() {
        // Roots 1e-9 and 1e9.
        let root = min_positive_root2(1.0, -(1e9 + 1e-9), 1.0).expect("root");
        assert!((root - 1e-9).abs() < 1e-20);
    }

    #[test]
    fn cubic_finds_three_real_roots() {
        // (x - 0.5)(x - 2)(x + 4)
        let (a, b, c, d) = (1.0, 1.5, -9.0, 4.0);
        assert_close(min_positive_root3(a, b, c, d, 1e-15, 1e-9), 0.5);
    }

    #[test]
    fn cubic_with_single_real_root() {
        // (x - 2)(x^2 + 1) = x^3 - 2x^2 + x - 2
        assert_close(min_positive_root3(1.0, -2.0, 1.0, -2.0, 1e-15, 1e-9), 2.0);
        // (x + 2)(x^2 + 1) has no positive root.
        assert_eq!(min_positive_root3(1.0, 2.0, 1.0, 2.0, 1e-15, 1e-9), None);
    }

    #[test]
    fn cubic_degrades_to_quadratic() {
        assert_close(min_positive_root3(0.0, 1.0, -4.0, 3.0, 1e-15, 1e-9), 1.0);
    }

    #[test]
    fn cubic_triple_root() {
        // (x - 1)^3
        assert_close(min_positive_root3(1.0, -3.0, 3.0, -1.0, 1e-15, 1e-9), 1.0);
    }

    proptest! {
        #[test]
        fn cubic_recovers_smallest_of_distinct_positive_roots(
            r1 in 0.01f64..10.0,
            gap1 in 0.05f64..10.0,
            gap2 in 0.05f64..10.0,
            scale in prop_oneof![-5.0f64..-0.1, 0.1f64..5.0],
        ) {
            let r2 = r1 + gap1;
            let r3 = r2 + gap2;
            let a = scale;
            let b = -scale * (r1 + r2 + r3);
            let c = scale * (r1 * r2 + r1 * r3 + r2 * r3);
            let d = -scale * r1 * r2 * r3;
            let root = min_positive_root3(a, b, c, d, 1e-15, 1e-12).expect("root");
            prop_assert!((root - r1).abs() <= 1e-6 * (1.0 + r1), "expected {}, got {}", r1, root);
        }

        #[test]
        fn quadratic_roots_satisfy_equation(
            a in prop_oneof![-5.0f64..-0.1, 0.1f64..5.0],
            b in -5.0f64..5.0,
            c in -5.0f64..5.0,
        ) {
            if let Some(root) = min_positive_root2(a, b, c) {
                prop_assert!(root > 0.0);
                let residual = (a * root + b) * root + c;
                prop_assert!(residual.abs() <= 1e-9 * (1.0 + root * root) * 10.0);
            }
        }
    }
}
