//! Spectral analysis of captured microphone signals: frequency weighted
//! sound pressure levels and fractional octave band levels.
//!
//! Signals are in Pascal. Every level in this module is in dB SPL, i.e.
//! relative to 20 µPa. The stimuli are periodic with a period equal to the
//! capture length, so the spectrum is taken over the whole capture without
//! a window.

use rustfft::{num_complex::Complex, FftPlanner};
use std::sync::Arc;

/// Reference sound pressure in Pascal.
pub const P_REF: f64 = 2e-5;

/// Levels never go below this, silence is not minus infinity.
pub const LEVEL_FLOOR_DB: f64 = -200.0;

/// Converts a mean square pressure in Pa² to dB SPL.
pub fn level_db(mean_square: f64) -> f64 {
    let level = 10.0 * (mean_square / (P_REF * P_REF)).log10();
    if level.is_finite() {
        level.max(LEVEL_FLOOR_DB)
    } else {
        LEVEL_FLOOR_DB
    }
}

/// Converts a level in dB SPL to a mean square pressure in Pa².
pub fn mean_square(level_db: f64) -> f64 {
    P_REF * P_REF * 10.0_f64.powf(level_db / 10.0)
}

/// Frequency weighting curves of IEC 61672.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weighting {
    /// IEC 61672 A weighting
    A,
    /// IEC 61672 C weighting
    C,
    /// No weighting
    Z,
}

impl Weighting {
    fn magnitude(&self, f: f64) -> f64 {
        const F1: f64 = 20.598_997;
        const F2: f64 = 107.652_65;
        const F3: f64 = 737.862_23;
        const F4: f64 = 12_194.217;
        let f2 = f * f;
        match self {
            Weighting::A => {
                F4 * F4 * f2 * f2
                    / ((f2 + F1 * F1)
                        * ((f2 + F2 * F2) * (f2 + F3 * F3)).sqrt()
                        * (f2 + F4 * F4))
            }
            Weighting::C => F4 * F4 * f2 / ((f2 + F1 * F1) * (f2 + F4 * F4)),
            Weighting::Z => 1.0,
        }
    }

    /// Power gain at `f`, normalised to 1 at 1 kHz.
    pub fn power_gain(&self, f: f64) -> f64 {
        let g = self.magnitude(f) / self.magnitude(1000.0);
        g * g
    }

    /// Gain at `f` in dB.
    pub fn gain_db(&self, f: f64) -> f64 {
        10.0 * self.power_gain(f).log10()
    }
}

/// One-sided power spectrum of a real signal. The bins sum up to the mean
/// square of the signal.
#[derive(Debug, Clone)]
pub struct PowerSpectrum {
    resolution: f64,
    power: Vec<f64>,
}

impl PowerSpectrum {
    /// Power spectrum of `signal`, with its own FFT planner.
    pub fn new(signal: &[f32], sample_rate: f64) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        Self::with_planner(&mut planner, signal, sample_rate)
    }

    /// Same as [PowerSpectrum::new], reusing the FFT plans of `planner`.
    pub fn with_planner(planner: &mut FftPlanner<f64>, signal: &[f32], sample_rate: f64) -> Self {
        let n = signal.len();
        if n == 0 {
            return Self {
                resolution: sample_rate,
                power: Vec::new(),
            };
        }

        let fft: Arc<dyn rustfft::Fft<f64>> = planner.plan_fft_forward(n);
        let mut buffer: Vec<Complex<f64>> = signal
            .iter()
            .map(|&x| Complex::new(x as f64, 0.0))
            .collect();
        fft.process(&mut buffer);

        let scale = 1.0 / (n as f64 * n as f64);
        let power = buffer[..=n / 2]
            .iter()
            .enumerate()
            .map(|(k, x)| {
                let one_sided = k == 0 || (n % 2 == 0 && k == n / 2);
                let c = if one_sided { 1.0 } else { 2.0 };
                c * x.norm_sqr() * scale
            })
            .collect();

        Self {
            resolution: sample_rate / n as f64,
            power,
        }
    }

    /// Frequency spacing of the bins in Hz.
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Mean square of the whole signal.
    pub fn mean_square(&self) -> f64 {
        self.power.iter().sum()
    }

    /// Mean square after frequency weighting.
    pub fn weighted_mean_square(&self, weighting: Weighting) -> f64 {
        match weighting {
            Weighting::Z => self.mean_square(),
            _ => self
                .power
                .iter()
                .enumerate()
                .skip(1)
                .map(|(k, p)| p * weighting.power_gain(k as f64 * self.resolution))
                .sum(),
        }
    }

    /// Mean square of the bins in `[lower, upper)`.
    pub fn band_mean_square(&self, lower: f64, upper: f64) -> f64 {
        let first = (lower / self.resolution).ceil().max(0.0) as usize;
        let end = ((upper / self.resolution).ceil().max(0.0) as usize).min(self.power.len());
        if first >= end {
            return 0.0;
        }
        self.power[first..end].iter().sum()
    }
}

/// Centre frequencies and edges of overlapping fractional octave bands.
#[derive(Debug, Clone, PartialEq)]
pub struct BandPlan {
    centres: Vec<f64>,
    half_width: f64,
}

impl BandPlan {
    /// Bands at `fmin·2^(k/bands_per_octave)` up to `fmax`, each spanning
    /// `(1 + overlap) / bands_per_octave` octaves around its centre.
    pub fn new(fmin: f64, fmax: f64, bands_per_octave: f64, overlap: f64) -> Self {
        let mut centres = Vec::new();
        if fmin > 0.0 && bands_per_octave > 0.0 {
            let limit = fmax * (1.0 + 1e-4);
            let mut k = 0;
            loop {
                let f = fmin * 2.0_f64.powf(k as f64 / bands_per_octave);
                if f > limit {
                    break;
                }
                centres.push(f);
                k += 1;
            }
        }
        let half_width = if bands_per_octave > 0.0 {
            (1.0 + overlap) / (2.0 * bands_per_octave)
        } else {
            0.0
        };
        Self {
            centres,
            half_width,
        }
    }

    /// Number of bands.
    pub fn len(&self) -> usize {
        self.centres.len()
    }

    /// Whether the plan has no bands.
    pub fn is_empty(&self) -> bool {
        self.centres.is_empty()
    }

    /// Centre frequencies of the bands, in Hz.
    pub fn centres(&self) -> &[f64] {
        &self.centres
    }

    /// Lower and upper edge of band `k`.
    pub fn edges(&self, k: usize) -> (f64, f64) {
        let f = self.centres[k];
        (
            f * 2.0_f64.powf(-self.half_width),
            f * 2.0_f64.powf(self.half_width),
        )
    }

    /// Level of every band in dB SPL.
    pub fn band_levels(&self, spectrum: &PowerSpectrum) -> Vec<f64> {
        (0..self.len())
            .map(|k| {
                let (lower, upper) = self.edges(k);
                level_db(spectrum.band_mean_square(lower, upper))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const FS: f64 = 48000.0;

    fn sine(freq: f64, amplitude: f64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (amplitude * (2.0 * PI * freq * i as f64 / FS).sin()) as f32)
            .collect()
    }

    #[test]
    fn levels_and_mean_squares_invert() {
        assert!((level_db(mean_square(70.0)) - 70.0).abs() < 1e-9);
        assert!((level_db(4e-10) - 0.0).abs() < 1e-9);
        assert_eq!(level_db(0.0), LEVEL_FLOOR_DB);
    }

    #[test]
    fn weighting_curves() {
        assert!(Weighting::A.gain_db(1000.0).abs() < 1e-9);
        assert!(Weighting::C.gain_db(1000.0).abs() < 1e-9);
        // IEC 61672 table values
        assert!((Weighting::A.gain_db(100.0) + 19.1).abs() < 0.1);
        assert!((Weighting::C.gain_db(31.5) + 3.0).abs() < 0.1);
        assert_eq!(Weighting::Z.gain_db(20.0), 0.0);
    }

    #[test]
    fn parseval() {
        let signal = sine(1000.0, 1.0, 4800);
        let spectrum = PowerSpectrum::new(&signal, FS);
        assert!((spectrum.mean_square() - 0.5).abs() < 1e-6);
        assert!((spectrum.resolution() - 10.0).abs() < 1e-12);
        assert!((spectrum.band_mean_square(995.0, 1005.0) - 0.5).abs() < 1e-6);
        assert!(spectrum.band_mean_square(1005.0, 2000.0) < 1e-9);
    }

    #[test]
    fn weighted_level_of_a_low_tone() {
        let signal = sine(100.0, 1.0, 4800);
        let spectrum = PowerSpectrum::new(&signal, FS);
        let unweighted = level_db(spectrum.weighted_mean_square(Weighting::Z));
        let a_weighted = level_db(spectrum.weighted_mean_square(Weighting::A));
        assert!((unweighted - a_weighted - 19.1).abs() < 0.1);
    }

    #[test]
    fn third_octave_plan() {
        let plan = BandPlan::new(62.5, 4000.0, 3.0, 2.0);
        assert_eq!(plan.len(), 19);
        assert!((plan.centres()[18] - 4000.0).abs() < 1e-6);
        let (lower, upper) = plan.edges(3);
        assert!((upper / lower - 2.0).abs() < 1e-12);

        let sub = BandPlan::new(31.25, 62.5, 3.0, 2.0);
        assert_eq!(sub.len(), 4);
    }

    #[test]
    fn empty_inputs() {
        assert!(BandPlan::new(0.0, 100.0, 3.0, 0.0).is_empty());
        let spectrum = PowerSpectrum::new(&[], FS);
        assert_eq!(spectrum.mean_square(), 0.0);
        assert_eq!(spectrum.band_mean_square(10.0, 100.0), 0.0);
    }

    #[test]
    fn band_level_of_a_tone() {
        // 94 dB SPL is 1 Pa rms
        let signal = sine(500.0, 2.0_f64.sqrt(), 48000);
        let spectrum = PowerSpectrum::new(&signal, FS);
        let plan = BandPlan::new(62.5, 4000.0, 3.0, 0.0);
        let levels = plan.band_levels(&spectrum);
        assert!((levels[9] - 93.98).abs() < 0.05);
        assert!(levels[0] < 0.0);
    }
}
