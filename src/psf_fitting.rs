//! Elliptical Gaussian PSF fitting.
//!
//! Each candidate's neighborhood is fitted with
//! `I(x, y) = B + A · exp(-Q)`, `Q = u²/(2σa²) + v²/(2σb²)` where `(u, v)` are
//! the offsets from the centroid rotated by θ. The seven parameters are found
//! by Levenberg–Marquardt on the normal equations `(JᵀJ + λD) δ = Jᵀr`.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use nalgebra::{SMatrix, SVector};
use std::f64::consts::{FRAC_PI_2, PI};
use tracing::trace;

use crate::models::{FitStatus, PixelMatrix, PsfFit, StarCandidate, FWHM_PER_SIGMA};

const N_PARAMS: usize = 7;
const X0: usize = 0;
const Y0: usize = 1;
const AMP: usize = 2;
const SIGMA_A: usize = 3;
const SIGMA_B: usize = 4;
const THETA: usize = 5;
const BG: usize = 6;

const INITIAL_LAMBDA: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const MAX_LAMBDA: f64 = 1e10;
const MIN_SIGMA: f64 = 1e-3;
/// Squared response of the unit-amplitude model to ln σ below which a
/// width is undetermined.
const MIN_WIDTH_INFORMATION: f64 = 1e-6;

type Params = SVector<f64, N_PARAMS>;
type Normal = SMatrix<f64, N_PARAMS, N_PARAMS>;

/// Tunables of the fitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitParams {
    pub expected_fwhm: f64,
    /// Cutout half-size as a multiple of the expected FWHM.
    pub cutout_scale: f64,
    pub max_iterations: usize,
    /// Relative SSR change below which the fit has converged.
    pub tolerance: f64,
    /// Allowed factor between the fitted and expected sigma.
    pub max_sigma_ratio: f64,
    /// Largest accepted `rms_residual / amplitude`.
    pub max_residual_fraction: f64,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            expected_fwhm: 5.0,
            cutout_scale: 2.0,
            max_iterations: 100,
            tolerance: 1e-6,
            max_sigma_ratio: 4.0,
            max_residual_fraction: 0.5,
        }
    }
}

impl FitParams {
    pub fn expected_sigma(&self) -> f64 {
        self.expected_fwhm / FWHM_PER_SIGMA
    }

    fn cutout_half_size(&self) -> usize {
        (self.cutout_scale * self.expected_fwhm).ceil().max(1.0) as usize
    }
}

/// Fit one candidate with a fresh scratch arena.
pub fn fit_star(pixels: &PixelMatrix, candidate: &StarCandidate, params: &FitParams) -> PsfFit {
    let bump = Bump::new();
    fit_star_in(pixels, candidate, params, &bump)
}

/// Fit every candidate, reusing one arena for the cutout buffers.
pub fn fit_stars(
    pixels: &PixelMatrix,
    candidates: &[StarCandidate],
    params: &FitParams,
    bump: &mut Bump,
) -> Vec<PsfFit> {
    candidates
        .iter()
        .map(|candidate| {
            let fit = fit_star_in(pixels, candidate, params, bump);
            bump.reset();
            fit
        })
        .collect()
}

/// Fit one candidate, allocating the cutout in `bump`.
pub fn fit_star_in(
    pixels: &PixelMatrix,
    candidate: &StarCandidate,
    params: &FitParams,
    bump: &Bump,
) -> PsfFit {
    let cutout = Cutout::extract(pixels, candidate, params.cutout_half_size(), bump);

    let initial = Params::from_column_slice(&[
        candidate.x as f64,
        candidate.y as f64,
        candidate.peak - candidate.background,
        params.expected_sigma(),
        params.expected_sigma(),
        0.0,
        candidate.background,
    ]);

    if cutout.len() < N_PARAMS + 1 {
        return finish(initial, &cutout, candidate, params, Outcome::insufficient());
    }

    let outcome = levenberg_marquardt(&cutout, initial, params);
    trace!(
        "⭐ fit at ({}, {}): {} iterations, converged {}, ssr {:.3e}",
        candidate.x,
        candidate.y,
        outcome.iterations,
        outcome.converged,
        outcome.ssr
    );
    finish(outcome.params, &cutout, candidate, params, outcome)
}

/// Pixels of the fitting window, in absolute frame coordinates.
struct Cutout<'a> {
    xs: BumpVec<'a, f64>,
    ys: BumpVec<'a, f64>,
    zs: BumpVec<'a, f64>,
}

impl<'a> Cutout<'a> {
    fn extract(pixels: &PixelMatrix, candidate: &StarCandidate, half: usize, bump: &'a Bump) -> Self {
        let x0 = candidate.x.saturating_sub(half);
        let y0 = candidate.y.saturating_sub(half);
        let x1 = (candidate.x + half).min(pixels.width() - 1);
        let y1 = (candidate.y + half).min(pixels.height() - 1);
        let capacity = (x1 + 1 - x0) * (y1 + 1 - y0);

        let mut cutout = Self {
            xs: BumpVec::with_capacity_in(capacity, bump),
            ys: BumpVec::with_capacity_in(capacity, bump),
            zs: BumpVec::with_capacity_in(capacity, bump),
        };
        for y in y0..=y1 {
            for x in x0..=x1 {
                let z = pixels.get(x, y) as f64;
                if z.is_finite() {
                    cutout.xs.push(x as f64);
                    cutout.ys.push(y as f64);
                    cutout.zs.push(z);
                }
            }
        }
        cutout
    }

    fn len(&self) -> usize {
        self.zs.len()
    }

    fn points(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        self.xs
            .iter()
            .zip(self.ys.iter())
            .zip(self.zs.iter())
            .map(|((&x, &y), &z)| (x, y, z))
    }

    fn ssr(&self, p: &Params) -> f64 {
        self.points()
            .map(|(x, y, z)| {
                let r = z - evaluate(p, x, y);
                r * r
            })
            .sum()
    }
}

/// Rotated offsets and the exponent `Q` at one pixel.
#[inline]
fn geometry(p: &Params, x: f64, y: f64) -> (f64, f64, f64, f64, f64) {
    let (sin_t, cos_t) = p[THETA].sin_cos();
    let dx = x - p[X0];
    let dy = y - p[Y0];
    let u = dx * cos_t + dy * sin_t;
    let v = -dx * sin_t + dy * cos_t;
    let sa2 = p[SIGMA_A] * p[SIGMA_A];
    let sb2 = p[SIGMA_B] * p[SIGMA_B];
    let q = u * u / (2.0 * sa2) + v * v / (2.0 * sb2);
    (u, v, q, sin_t, cos_t)
}

#[inline]
fn evaluate(p: &Params, x: f64, y: f64) -> f64 {
    let (_, _, q, _, _) = geometry(p, x, y);
    p[BG] + p[AMP] * (-q).exp()
}

/// Partial derivatives of the model with respect to each parameter.
#[inline]
fn jacobian_row(p: &Params, x: f64, y: f64) -> Params {
    let (u, v, q, sin_t, cos_t) = geometry(p, x, y);
    let sa = p[SIGMA_A];
    let sb = p[SIGMA_B];
    let sa2 = sa * sa;
    let sb2 = sb * sb;
    let e = (-q).exp();
    let ae = p[AMP] * e;

    let dq_dx0 = -u * cos_t / sa2 + v * sin_t / sb2;
    let dq_dy0 = -u * sin_t / sa2 - v * cos_t / sb2;
    let dq_dsa = -u * u / (sa2 * sa);
    let dq_dsb = -v * v / (sb2 * sb);
    let dq_dtheta = u * v * (1.0 / sa2 - 1.0 / sb2);

    Params::from_column_slice(&[
        -ae * dq_dx0,
        -ae * dq_dy0,
        e,
        -ae * dq_dsa,
        -ae * dq_dsb,
        -ae * dq_dtheta,
        1.0,
    ])
}

fn constrain(p: &mut Params) {
    p[SIGMA_A] = p[SIGMA_A].abs().max(MIN_SIGMA);
    p[SIGMA_B] = p[SIGMA_B].abs().max(MIN_SIGMA);
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    params: Params,
    ssr: f64,
    iterations: usize,
    converged: bool,
    singular: bool,
    insufficient: bool,
}

impl Outcome {
    fn insufficient() -> Self {
        Self {
            params: Params::zeros(),
            ssr: f64::NAN,
            iterations: 0,
            converged: false,
            singular: false,
            insufficient: true,
        }
    }
}

fn normal_equations(cutout: &Cutout, p: &Params) -> (Normal, Params) {
    let mut hessian = Normal::zeros();
    let mut gradient = Params::zeros();
    for (x, y, z) in cutout.points() {
        let row = jacobian_row(p, x, y);
        let residual = z - evaluate(p, x, y);
        hessian += row * row.transpose();
        gradient += row * residual;
    }
    (hessian, gradient)
}

fn solve(system: Normal, rhs: &Params) -> Option<Params> {
    if let Some(cholesky) = system.cholesky() {
        return Some(cholesky.solve(rhs));
    }
    system.lu().solve(rhs)
}

fn levenberg_marquardt(cutout: &Cutout, initial: Params, config: &FitParams) -> Outcome {
    let mut params = initial;
    let mut ssr = cutout.ssr(&params);
    let data_energy: f64 = cutout.points().map(|(_, _, z)| z * z).sum();
    let mut lambda = INITIAL_LAMBDA;
    let mut converged = false;
    let mut accepted_any = false;
    let mut solve_failed = false;
    let mut iterations = 0;

    if !ssr.is_finite() {
        return Outcome {
            params,
            ssr,
            iterations,
            converged,
            singular: true,
            insufficient: false,
        };
    }

    let (mut hessian, mut gradient) = normal_equations(cutout, &params);

    for iter in 0..config.max_iterations {
        iterations = iter + 1;

        // Marquardt scaling with a floor so a flat direction (θ of a round
        // star) still gets damped instead of making the system singular.
        let largest = hessian.diagonal().iter().fold(0.0f64, |acc, &v| acc.max(v));
        let floor = largest * 1e-12 + f64::MIN_POSITIVE;
        let mut damped = hessian;
        for i in 0..N_PARAMS {
            damped[(i, i)] += lambda * hessian[(i, i)].max(floor);
        }

        let Some(delta) = solve(damped, &gradient).filter(|d| d.iter().all(|v| v.is_finite()))
        else {
            solve_failed = true;
            lambda *= LAMBDA_UP;
            if lambda > MAX_LAMBDA {
                break;
            }
            continue;
        };
        solve_failed = false;

        let mut candidate = params + delta;
        constrain(&mut candidate);
        let new_ssr = cutout.ssr(&candidate);

        if new_ssr.is_finite() && new_ssr < ssr {
            let relative_change = (ssr - new_ssr) / ssr;
            params = candidate;
            ssr = new_ssr;
            accepted_any = true;
            lambda = (lambda * LAMBDA_DOWN).max(1e-12);

            if relative_change < config.tolerance || ssr <= data_energy * f64::EPSILON {
                converged = true;
                break;
            }
            let (h, g) = normal_equations(cutout, &params);
            hessian = h;
            gradient = g;
        } else {
            lambda *= LAMBDA_UP;
            if lambda > MAX_LAMBDA {
                // No damped step lowers the SSR: this is a local minimum.
                converged = true;
                break;
            }
        }
    }

    let singular = (solve_failed && !accepted_any) || !width_is_constrained(cutout, &params);
    Outcome {
        params,
        ssr,
        iterations,
        converged: converged && !singular,
        singular,
        insufficient: false,
    }
}

/// Whether the pixels constrain both widths at `p`: the unit-amplitude
/// model must change measurably when ln σ changes. A profile much narrower
/// than a pixel leaves the σ columns of JᵀJ empty, so the widths never leave
/// their starting guess.
fn width_is_constrained(cutout: &Cutout, p: &Params) -> bool {
    let inv_a2 = 1.0 / (p[SIGMA_A] * p[SIGMA_A]);
    let inv_b2 = 1.0 / (p[SIGMA_B] * p[SIGMA_B]);
    let (mut info_a, mut info_b) = (0.0f64, 0.0f64);
    for (x, y, _) in cutout.points() {
        let (u, v, q, _, _) = geometry(p, x, y);
        let e = (-q).exp();
        let da = e * u * u * inv_a2;
        let db = e * v * v * inv_b2;
        info_a += da * da;
        info_b += db * db;
    }
    info_a >= MIN_WIDTH_INFORMATION && info_b >= MIN_WIDTH_INFORMATION
}

/// Canonicalize the parameters and classify the fit.
fn finish(
    mut p: Params,
    cutout: &Cutout,
    candidate: &StarCandidate,
    params: &FitParams,
    outcome: Outcome,
) -> PsfFit {
    if p[SIGMA_B] > p[SIGMA_A] {
        p.swap_rows(SIGMA_A, SIGMA_B);
        p[THETA] += FRAC_PI_2;
    }
    p[THETA] = normalize_angle(p[THETA]);

    let count = cutout.len().max(1) as f64;
    let rms_residual = if outcome.insufficient {
        f64::NAN
    } else {
        (outcome.ssr / count).sqrt()
    };
    let normalized_residual = if p[AMP] > 0.0 {
        rms_residual / p[AMP]
    } else {
        f64::INFINITY
    };

    let mut fit = PsfFit {
        x: p[X0],
        y: p[Y0],
        amplitude: p[AMP],
        background: p[BG],
        sigma_major: p[SIGMA_A],
        sigma_minor: p[SIGMA_B],
        theta: p[THETA],
        rms_residual,
        normalized_residual,
        iterations: outcome.iterations,
        converged: outcome.converged,
        status: FitStatus::Valid,
    };
    fit.status = assess(&fit, candidate, params, &outcome);
    fit
}

/// Map an angle into `[-π/2, π/2)`.
fn normalize_angle(theta: f64) -> f64 {
    (theta + FRAC_PI_2).rem_euclid(PI) - FRAC_PI_2
}

fn assess(fit: &PsfFit, candidate: &StarCandidate, params: &FitParams, outcome: &Outcome) -> FitStatus {
    if outcome.insufficient {
        return FitStatus::InsufficientData;
    }
    if outcome.singular {
        return FitStatus::Singular;
    }
    if !outcome.converged {
        return FitStatus::DidNotConverge;
    }
    if !(fit.amplitude > 0.0) {
        return FitStatus::NonPositiveAmplitude;
    }

    let drift = (fit.x - candidate.x as f64).hypot(fit.y - candidate.y as f64);
    if !(drift <= params.expected_fwhm) {
        return FitStatus::CentroidDrift;
    }

    let expected = params.expected_sigma();
    let min_sigma = expected / params.max_sigma_ratio;
    let max_sigma = expected * params.max_sigma_ratio;
    let in_range = |s: f64| s >= min_sigma && s <= max_sigma;
    if !in_range(fit.sigma_major) || !in_range(fit.sigma_minor) {
        return FitStatus::SigmaOutOfRange;
    }

    if !(fit.normalized_residual <= params.max_residual_fraction) {
        return FitStatus::ResidualTooLarge;
    }
    FitStatus::Valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{StarField, SyntheticStar};

    fn candidate_at(pixels: &PixelMatrix, x: usize, y: usize, background: f64) -> StarCandidate {
        StarCandidate {
            x,
            y,
            peak: pixels.get(x, y) as f64,
            background,
        }
    }

    fn params_for(fwhm: f64) -> FitParams {
        FitParams {
            expected_fwhm: fwhm,
            ..FitParams::default()
        }
    }

    #[test]
    fn test_round_star_fwhm() {
        let pixels = StarField::new(64, 64, 1000.0, 0.0)
            .with_star(SyntheticStar::round(32.3, 31.8, 5000.0, 3.0))
            .render();
        let candidate = candidate_at(&pixels, 32, 32, 1000.0);

        let fit = fit_star(&pixels, &candidate, &params_for(7.0));
        assert!(fit.is_valid(), "{:?}", fit);
        assert!((fit.fwhm() - 3.0 * FWHM_PER_SIGMA).abs() < 0.05, "fwhm {}", fit.fwhm());
        assert!(fit.eccentricity() < 0.05, "ecc {}", fit.eccentricity());
        assert!((fit.x - 32.3).abs() < 0.01);
        assert!((fit.y - 31.8).abs() < 0.01);
        assert!((fit.amplitude - 5000.0).abs() < 5.0);
        assert!((fit.background - 1000.0).abs() < 1.0);
    }

    #[test]
    fn test_round_star_with_noise() {
        let pixels = StarField::new(64, 64, 1000.0, 10.0)
            .with_star(SyntheticStar::round(32.0, 32.0, 5000.0, 3.0))
            .render();
        let candidate = candidate_at(&pixels, 32, 32, 1000.0);

        let fit = fit_star(&pixels, &candidate, &params_for(7.0));
        assert!(fit.is_valid(), "{:?}", fit);
        assert!((fit.fwhm() - 7.0644).abs() < 0.15, "fwhm {}", fit.fwhm());
        assert!(fit.eccentricity() < 0.25, "ecc {}", fit.eccentricity());
        assert!(fit.sigma_major >= fit.sigma_minor);
    }

    #[test]
    fn test_elongated_star_eccentricity_and_angle() {
        let star = SyntheticStar {
            x: 40.0,
            y: 40.0,
            amplitude: 4000.0,
            sigma_major: 4.0,
            sigma_minor: 2.0,
            theta: 0.5,
        };
        let pixels = StarField::new(80, 80, 500.0, 2.0).with_star(star).render();
        let candidate = candidate_at(&pixels, 40, 40, 500.0);

        let fit = fit_star(&pixels, &candidate, &params_for(6.5));
        assert!(fit.is_valid(), "{:?}", fit);
        assert!((fit.eccentricity() - 0.866).abs() < 0.02, "ecc {}", fit.eccentricity());
        assert!((fit.sigma_major - 4.0).abs() < 0.1);
        assert!((fit.sigma_minor - 2.0).abs() < 0.1);
        assert!((fit.theta - 0.5).abs() < 0.05, "theta {}", fit.theta);
    }

    #[test]
    fn test_axes_swapped_so_major_is_larger() {
        let star = SyntheticStar {
            x: 40.0,
            y: 40.0,
            amplitude: 4000.0,
            sigma_major: 2.0,
            sigma_minor: 4.0,
            theta: 0.0,
        };
        let pixels = StarField::new(80, 80, 500.0, 0.0).with_star(star).render();
        let candidate = candidate_at(&pixels, 40, 40, 500.0);

        let fit = fit_star(&pixels, &candidate, &params_for(6.5));
        assert!(fit.is_valid(), "{:?}", fit);
        assert!(fit.sigma_major > fit.sigma_minor);
        assert!((fit.sigma_major - 4.0).abs() < 0.05);
        assert!((fit.theta.abs() - FRAC_PI_2).abs() < 0.02, "theta {}", fit.theta);
        assert!(fit.theta >= -FRAC_PI_2 && fit.theta < FRAC_PI_2);
    }

    #[test]
    fn test_subpixel_guess_leaves_width_unfitted() {
        let pixels = StarField::new(64, 64, 1000.0, 0.0)
            .with_star(SyntheticStar::round(32.0, 32.0, 4000.0, 2.0))
            .render();
        let candidate = candidate_at(&pixels, 32, 32, 1000.0);

        for fwhm in [0.05, 0.1, 0.2] {
            let fit = fit_star(&pixels, &candidate, &params_for(fwhm));
            assert!(!fit.is_valid(), "fwhm {} -> {:?}", fwhm, fit);
            assert_eq!(fit.status, FitStatus::Singular);
            assert!(!fit.converged);
        }

        // A usable guess still recovers the real width
        let fit = fit_star(&pixels, &candidate, &params_for(1.5));
        assert!(fit.is_valid(), "{:?}", fit);
        assert!((fit.fwhm() - 2.0 * FWHM_PER_SIGMA).abs() < 0.1, "fwhm {}", fit.fwhm());
    }

    #[test]
    fn test_iteration_cap_reports_did_not_converge() {
        let pixels = StarField::new(64, 64, 1000.0, 5.0)
            .with_star(SyntheticStar::round(32.4, 31.7, 5000.0, 3.0))
            .render();
        let candidate = candidate_at(&pixels, 32, 32, 1000.0);
        let params = FitParams {
            max_iterations: 1,
            ..params_for(5.0)
        };

        let fit = fit_star(&pixels, &candidate, &params);
        assert_eq!(fit.status, FitStatus::DidNotConverge, "{:?}", fit);
        assert!(!fit.is_valid());
        assert!(!fit.converged);
        assert_eq!(fit.iterations, 1);
    }

    #[test]
    fn test_tiny_cutout_is_insufficient() {
        let pixels = PixelMatrix::new(2, 2, vec![1.0, 2.0, 3.0, 9.0]).unwrap();
        let candidate = candidate_at(&pixels, 1, 1, 1.0);
        let fit = fit_star(&pixels, &candidate, &FitParams::default());
        assert_eq!(fit.status, FitStatus::InsufficientData);
        assert!(!fit.is_valid());
        assert!(!fit.converged);
    }

    #[test]
    fn test_normalize_angle() {
        assert!((normalize_angle(0.3) - 0.3).abs() < 1e-12);
        assert!((normalize_angle(FRAC_PI_2) + FRAC_PI_2).abs() < 1e-12);
        assert!((normalize_angle(PI + 0.2) - 0.2).abs() < 1e-12);
        assert!((normalize_angle(-PI + 0.1) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_assess_rejections() {
        let params = params_for(5.0);
        let candidate = StarCandidate {
            x: 10,
            y: 10,
            peak: 200.0,
            background: 100.0,
        };
        let outcome = Outcome {
            params: Params::zeros(),
            ssr: 1.0,
            iterations: 5,
            converged: true,
            singular: false,
            insufficient: false,
        };
        let good = PsfFit {
            x: 10.2,
            y: 9.9,
            amplitude: 100.0,
            background: 100.0,
            sigma_major: 2.2,
            sigma_minor: 2.0,
            theta: 0.0,
            rms_residual: 1.0,
            normalized_residual: 0.01,
            iterations: 5,
            converged: true,
            status: FitStatus::Valid,
        };
        assert_eq!(assess(&good, &candidate, &params, &outcome), FitStatus::Valid);

        let negative = PsfFit {
            amplitude: -5.0,
            ..good
        };
        assert_eq!(
            assess(&negative, &candidate, &params, &outcome),
            FitStatus::NonPositiveAmplitude
        );

        let drifted = PsfFit { x: 20.0, ..good };
        assert_eq!(assess(&drifted, &candidate, &params, &outcome), FitStatus::CentroidDrift);

        let bloated = PsfFit {
            sigma_major: 20.0,
            ..good
        };
        assert_eq!(
            assess(&bloated, &candidate, &params, &outcome),
            FitStatus::SigmaOutOfRange
        );

        let noisy = PsfFit {
            normalized_residual: 0.9,
            ..good
        };
        assert_eq!(
            assess(&noisy, &candidate, &params, &outcome),
            FitStatus::ResidualTooLarge
        );

        let stalled = Outcome {
            converged: false,
            ..outcome
        };
        assert_eq!(assess(&good, &candidate, &params, &stalled), FitStatus::DidNotConverge);

        let singular = Outcome {
            singular: true,
            converged: false,
            ..outcome
        };
        assert_eq!(assess(&good, &candidate, &params, &singular), FitStatus::Singular);
    }

    #[test]
    fn test_fit_stars_reuses_arena() {
        let pixels = StarField::new(96, 96, 200.0, 1.0)
            .with_star(SyntheticStar::round(30.0, 30.0, 2000.0, 2.0))
            .with_star(SyntheticStar::round(65.0, 60.0, 1500.0, 2.0))
            .render();
        let candidates = vec![
            candidate_at(&pixels, 30, 30, 200.0),
            candidate_at(&pixels, 65, 60, 200.0),
        ];
        let mut bump = Bump::new();
        let fits = fit_stars(&pixels, &candidates, &params_for(4.7), &mut bump);
        assert_eq!(fits.len(), 2);
        assert!(fits.iter().all(|f| f.is_valid()), "{:?}", fits);
    }
}
