//! Cascaded peaking equalizers and the optimizer that fits them to a
//! measured correction curve.
//!
//! A [MultibandPeq] is a chain of second order peaking sections (RBJ
//! cookbook). [MultibandPeq::fit] places one section at a time on the
//! largest remaining deviation, then refines all of them together with a
//! damped Gauss-Newton (Levenberg-Marquardt) search over
//! `(log2 f, gain, ln q)`. The search has no random component, so the same
//! curve always gives the same filter.

use log::debug;
use std::f64::consts::PI;
use std::fmt;

/// Sample rate assumed by [MultibandPeq::default].
pub const DEFAULT_SAMPLE_RATE: f64 = 48000.0;

/// Largest boost or cut a single stage may apply, in dB.
pub const MAX_STAGE_GAIN_DB: f64 = 30.0;
const Q_MIN: f64 = 0.3;
const Q_MAX: f64 = 12.0;
const Q_INITIAL: f64 = std::f64::consts::SQRT_2;

/// Stages are kept below this fraction of the sample rate.
const MAX_FREQ_FRACTION: f64 = 0.45;
/// Minimum distance between two greedily placed stages, in octaves.
const MIN_STAGE_DISTANCE_OCT: f64 = 1.0 / 3.0;

const LM_MAX_ITER: usize = 200;
const LM_LAMBDA_MAX: f64 = 1e8;
const LM_CONVERGENCE: f64 = 1e-7;

/// Parameters of one peaking section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeqStage {
    /// Centre frequency in Hz
    pub freq: f64,
    /// Gain at the centre frequency in dB
    pub gain_db: f64,
    /// Quality factor
    pub q: f64,
}

/// A second order IIR section in transposed direct form II.
#[derive(Debug, Clone, PartialEq)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    /// Peaking section with coefficients normalised by `a0`.
    pub fn peaking(stage: &PeqStage, sample_rate: f64) -> Self {
        let w0 = 2.0 * PI * stage.freq / sample_rate;
        let a_lin = 10.0_f64.powf(stage.gain_db / 40.0);
        let alpha = w0.sin() / (2.0 * stage.q);
        let cos_w0 = w0.cos();

        let a0 = 1.0 + alpha / a_lin;
        Self {
            b0: (1.0 + alpha * a_lin) / a0,
            b1: -2.0 * cos_w0 / a0,
            b2: (1.0 - alpha * a_lin) / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha / a_lin) / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// Filters one sample.
    #[inline]
    pub fn process_sample(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    /// Clears the filter memory.
    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    /// Magnitude response at `freq` in dB.
    pub fn response_db(&self, freq: f64, sample_rate: f64) -> f64 {
        let w = 2.0 * PI * freq / sample_rate;
        let (cos_w, sin_w) = (w.cos(), w.sin());
        let (cos_2w, sin_2w) = ((2.0 * w).cos(), (2.0 * w).sin());

        let num_re = self.b0 + self.b1 * cos_w + self.b2 * cos_2w;
        let num_im = -self.b1 * sin_w - self.b2 * sin_2w;
        let den_re = 1.0 + self.a1 * cos_w + self.a2 * cos_2w;
        let den_im = -self.a1 * sin_w - self.a2 * sin_2w;

        let num = num_re * num_re + num_im * num_im;
        let den = den_re * den_re + den_im * den_im;
        if den < 1e-30 || num < 1e-30 {
            return 0.0;
        }
        10.0 * (num / den).log10()
    }
}

/// A cascade of peaking sections. With no stages it is a pass-through
/// filter, which is what speakers without frequency correction carry.
#[derive(Debug, Clone)]
pub struct MultibandPeq {
    sample_rate: f64,
    stages: Vec<PeqStage>,
    sections: Vec<Biquad>,
}

impl Default for MultibandPeq {
    fn default() -> Self {
        Self::identity(DEFAULT_SAMPLE_RATE)
    }
}

impl PartialEq for MultibandPeq {
    fn eq(&self, other: &Self) -> bool {
        self.sample_rate == other.sample_rate && self.stages == other.stages
    }
}

impl MultibandPeq {
    /// Pass-through filter.
    pub fn identity(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            stages: Vec::new(),
            sections: Vec::new(),
        }
    }

    /// A cascade of the given stages.
    pub fn from_stages(stages: Vec<PeqStage>, sample_rate: f64) -> Self {
        let sections = stages
            .iter()
            .map(|s| Biquad::peaking(s, sample_rate))
            .collect();
        Self {
            sample_rate,
            stages,
            sections,
        }
    }

    /// Fits `stage_count` peaking sections so that the cascade approximates
    /// `target_db` at `freqs`. Zero stages, or an empty curve, give the
    /// identity filter.
    pub fn fit(stage_count: usize, freqs: &[f32], target_db: &[f32], sample_rate: f64) -> Self {
        let n = freqs.len().min(target_db.len());
        if stage_count == 0 || n == 0 {
            return Self::identity(sample_rate);
        }
        let freqs: Vec<f64> = freqs[..n].iter().map(|&f| f as f64).collect();
        let target: Vec<f64> = target_db[..n].iter().map(|&g| g as f64).collect();

        let fitter = PeqFitter::new(&freqs, &target, sample_rate);
        let initial = fitter.greedy_init(stage_count);
        let (stages, iterations, cost) = fitter.refine(initial);
        debug!(
            "fitted {} stages to {} points in {} iterations, rms error {:.3} dB",
            stage_count,
            n,
            iterations,
            (cost / n as f64).sqrt()
        );

        Self::from_stages(stages, sample_rate)
    }

    /// Sample rate the stages were designed for.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// The stages of the cascade.
    pub fn stages(&self) -> &[PeqStage] {
        &self.stages
    }

    /// Whether the cascade passes everything unchanged.
    pub fn is_identity(&self) -> bool {
        self.stages.is_empty()
    }

    /// Magnitude response in dB at each frequency.
    pub fn response_db(&self, freqs: &[f64]) -> Vec<f64> {
        freqs
            .iter()
            .map(|&f| {
                self.sections
                    .iter()
                    .map(|s| s.response_db(f, self.sample_rate))
                    .sum()
            })
            .collect()
    }

    /// Filters `buf` in place, keeping the section state across calls.
    pub fn process(&mut self, buf: &mut [f32]) {
        if self.sections.is_empty() {
            return;
        }
        for sample in buf.iter_mut() {
            let mut x = *sample as f64;
            for section in self.sections.iter_mut() {
                x = section.process_sample(x);
            }
            *sample = x as f32;
        }
    }

    /// Clears the memory of every stage.
    pub fn reset(&mut self) {
        for section in self.sections.iter_mut() {
            section.reset();
        }
    }
}

impl fmt::Display for MultibandPeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stages.is_empty() {
            return write!(f, "pareq fs={} Hz: identity", self.sample_rate);
        }
        write!(f, "pareq fs={} Hz:", self.sample_rate)?;
        for stage in &self.stages {
            write!(
                f,
                " [f={:.1} Hz g={:.2} dB q={:.3}]",
                stage.freq, stage.gain_db, stage.q
            )?;
        }
        Ok(())
    }
}

/// Magnitude in dB of a single peaking section, without building one.
fn peaking_mag_db(freq: f64, stage: &PeqStage, sample_rate: f64) -> f64 {
    if stage.gain_db.abs() < 1e-10 {
        return 0.0;
    }
    Biquad::peaking(stage, sample_rate).response_db(freq, sample_rate)
}

struct PeqFitter<'a> {
    freqs: &'a [f64],
    target: &'a [f64],
    sample_rate: f64,
    log_fmin: f64,
    log_fmax: f64,
}

impl<'a> PeqFitter<'a> {
    fn new(freqs: &'a [f64], target: &'a [f64], sample_rate: f64) -> Self {
        let nyquist_limit = MAX_FREQ_FRACTION * sample_rate;
        let fmin = freqs
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min)
            .clamp(1.0, nyquist_limit);
        let fmax = freqs
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max)
            .clamp(fmin, nyquist_limit);
        Self {
            freqs,
            target,
            sample_rate,
            log_fmin: fmin.log2(),
            log_fmax: fmax.log2(),
        }
    }

    fn params_to_stages(params: &[f64]) -> Vec<PeqStage> {
        params
            .chunks(3)
            .map(|p| PeqStage {
                freq: p[0].exp2(),
                gain_db: p[1],
                q: p[2].exp(),
            })
            .collect()
    }

    fn stages_to_params(stages: &[PeqStage]) -> Vec<f64> {
        stages
            .iter()
            .flat_map(|s| [s.freq.log2(), s.gain_db, s.q.ln()])
            .collect()
    }

    fn clamp_params(&self, params: &mut [f64]) {
        for p in params.chunks_mut(3) {
            p[0] = p[0].clamp(self.log_fmin, self.log_fmax);
            p[1] = p[1].clamp(-MAX_STAGE_GAIN_DB, MAX_STAGE_GAIN_DB);
            p[2] = p[2].clamp(Q_MIN.ln(), Q_MAX.ln());
        }
    }

    fn residuals(&self, params: &[f64]) -> Vec<f64> {
        let stages = Self::params_to_stages(params);
        self.freqs
            .iter()
            .zip(self.target)
            .map(|(&f, &t)| {
                let response: f64 = stages
                    .iter()
                    .map(|s| peaking_mag_db(f, s, self.sample_rate))
                    .sum();
                response - t
            })
            .collect()
    }

    fn cost(&self, params: &[f64]) -> f64 {
        self.residuals(params).iter().map(|r| r * r).sum()
    }

    /// Places stages one after another on the largest remaining deviation,
    /// keeping them at least a third of an octave apart.
    fn greedy_init(&self, stage_count: usize) -> Vec<PeqStage> {
        let mut error: Vec<f64> = self.target.to_vec();
        let mut available = vec![true; self.freqs.len()];
        let mut stages = Vec::with_capacity(stage_count);

        for _ in 0..stage_count {
            let peak = error
                .iter()
                .enumerate()
                .filter(|(i, _)| available[*i])
                .max_by(|(_, a), (_, b)| a.abs().total_cmp(&b.abs()));

            let stage = match peak {
                Some((idx, &err)) => PeqStage {
                    freq: self.freqs[idx]
                        .clamp(self.log_fmin.exp2(), self.log_fmax.exp2()),
                    gain_db: err.clamp(-MAX_STAGE_GAIN_DB, MAX_STAGE_GAIN_DB),
                    q: Q_INITIAL,
                },
                // every point is taken, park the stage in the middle
                None => PeqStage {
                    freq: (0.5 * (self.log_fmin + self.log_fmax)).exp2(),
                    gain_db: 0.0,
                    q: Q_INITIAL,
                },
            };

            for (i, &f) in self.freqs.iter().enumerate() {
                error[i] -= peaking_mag_db(f, &stage, self.sample_rate);
                if (f / stage.freq).log2().abs() < MIN_STAGE_DISTANCE_OCT {
                    available[i] = false;
                }
            }
            stages.push(stage);
        }

        stages
    }

    fn jacobian(&self, params: &[f64], r0: &[f64]) -> Vec<Vec<f64>> {
        let m = r0.len();
        let mut jacobian = vec![vec![0.0_f64; params.len()]; m];
        for p in 0..params.len() {
            let h = if p % 3 == 1 { 1e-3 } else { 1e-4 };
            let mut shifted = params.to_vec();
            shifted[p] += h;
            let r_h = self.residuals(&shifted);
            for i in 0..m {
                jacobian[i][p] = (r_h[i] - r0[i]) / h;
            }
        }
        jacobian
    }

    /// Levenberg-Marquardt refinement of all stages at once. Returns the
    /// stages, the number of iterations and the final squared error.
    fn refine(&self, initial: Vec<PeqStage>) -> (Vec<PeqStage>, usize, f64) {
        let mut params = Self::stages_to_params(&initial);
        self.clamp_params(&mut params);
        let n_params = params.len();

        let mut lambda = 1e-2_f64;
        let mut cost = self.cost(&params);
        let mut iterations = 0;

        for iter in 0..LM_MAX_ITER {
            iterations = iter + 1;
            if lambda > LM_LAMBDA_MAX || cost < 1e-12 {
                break;
            }

            let residuals = self.residuals(&params);
            let jacobian = self.jacobian(&params, &residuals);

            // H = JᵀJ, g = Jᵀr
            let mut h = vec![vec![0.0_f64; n_params]; n_params];
            let mut g = vec![0.0_f64; n_params];
            for (row, r) in jacobian.iter().zip(&residuals) {
                for i in 0..n_params {
                    g[i] += row[i] * r;
                    for j in 0..=i {
                        h[i][j] += row[i] * row[j];
                    }
                }
            }
            for i in 0..n_params {
                for j in 0..i {
                    h[j][i] = h[i][j];
                }
            }

            let mut damped = h.clone();
            for i in 0..n_params {
                damped[i][i] += lambda * h[i][i].max(1e-8);
            }
            let neg_g: Vec<f64> = g.iter().map(|gi| -gi).collect();

            let delta = match cholesky_solve(&damped, &neg_g) {
                Some(d) => d,
                None => {
                    lambda *= 4.0;
                    continue;
                }
            };

            let mut trial: Vec<f64> = params.iter().zip(&delta).map(|(p, d)| p + d).collect();
            self.clamp_params(&mut trial);
            let trial_cost = self.cost(&trial);

            if trial_cost < cost {
                let improvement = (cost - trial_cost) / cost.max(1e-30);
                params = trial;
                cost = trial_cost;
                lambda = (lambda * 0.3).max(1e-12);
                if improvement < LM_CONVERGENCE {
                    break;
                }
            } else {
                lambda *= 2.0;
            }
        }

        (Self::params_to_stages(&params), iterations, cost)
    }
}

/// Solves `A·x = b` for symmetric positive definite `A`. Returns None when
/// the decomposition breaks down.
fn cholesky_solve(a: &[Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
    let n = a.len();
    if n == 0 || b.len() != n {
        return None;
    }

    let mut l = vec![vec![0.0_f64; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let diag = a[i][i] - sum;
                if diag <= 0.0 {
                    return None;
                }
                l[i][j] = diag.sqrt();
            } else {
                l[i][j] = (a[i][j] - sum) / l[j][j];
            }
        }
    }

    let mut y = vec![0.0_f64; n];
    for i in 0..n {
        let sum: f64 = (0..i).map(|j| l[i][j] * y[j]).sum();
        y[i] = (b[i] - sum) / l[i][i];
    }

    let mut x = vec![0.0_f64; n];
    for i in (0..n).rev() {
        let sum: f64 = ((i + 1)..n).map(|j| l[j][i] * x[j]).sum();
        x[i] = (y[i] - sum) / l[i][i];
    }

    Some(x)
}
