//! Periodic band limited pink noise, the test signal played through every
//! speaker during a measurement.
//!
//! The noise is synthesised in the frequency domain: every bin inside the
//! band gets a magnitude falling with 3 dB per octave and a random phase,
//! everything else is zero. One period therefore contains exactly the
//! requested band, and a capture of one period length sees no leakage.

use rand::{rngs::StdRng, Rng, SeedableRng};
use rustfft::{num_complex::Complex, FftPlanner};
use std::f64::consts::PI;

use crate::{engine::StimulusSpec, spectrum::P_REF};

/// One period of pink noise between `spec.fmin` and `spec.fmax`, scaled to
/// an rms of `spec.level` dB SPL. The same seed gives the same signal.
pub fn pink_noise(spec: &StimulusSpec, sample_rate: f64, seed: u64) -> Vec<f32> {
    let n = (spec.period * sample_rate).round().max(0.0) as usize;
    if n < 2 {
        return vec![0.0; n];
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let resolution = sample_rate / n as f64;
    let last_bin = (n - 1) / 2;

    let mut bins: Vec<usize> = (1..=last_bin)
        .filter(|&k| {
            let f = k as f64 * resolution;
            f >= spec.fmin && f <= spec.fmax
        })
        .collect();
    if bins.is_empty() {
        // band narrower than the resolution, use the closest bin
        let centre = (spec.fmin.max(resolution) * spec.fmax.max(resolution)).sqrt();
        bins.push(((centre / resolution).round() as usize).clamp(1, last_bin.max(1)));
    }

    let mut buffer = vec![Complex::new(0.0_f64, 0.0); n];
    for k in bins {
        let magnitude = 1.0 / (k as f64 * resolution).sqrt();
        let phase = rng.gen_range(0.0..2.0 * PI);
        let value = Complex::from_polar(magnitude, phase);
        buffer[k] = value;
        buffer[n - k] = value.conj();
    }

    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_inverse(n).process(&mut buffer);

    let rms = (buffer.iter().map(|x| x.re * x.re).sum::<f64>() / n as f64).sqrt();
    let target = P_REF * 10.0_f64.powf(spec.level / 20.0);
    let scale = if rms > 0.0 { target / rms } else { 0.0 };
    buffer.iter().map(|x| (x.re * scale) as f32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::{level_db, BandPlan, PowerSpectrum};

    const FS: f64 = 48000.0;

    fn spec(level: f64, fmin: f64, fmax: f64) -> StimulusSpec {
        StimulusSpec {
            level,
            period: 1.0,
            fmin,
            fmax,
        }
    }

    #[test]
    fn has_the_requested_level() {
        let noise = pink_noise(&spec(70.0, 62.5, 4000.0), FS, 1);
        assert_eq!(noise.len(), 48000);
        let spectrum = PowerSpectrum::new(&noise, FS);
        assert!((level_db(spectrum.mean_square()) - 70.0).abs() < 0.01);
    }

    #[test]
    fn stays_inside_the_band() {
        let noise = pink_noise(&spec(70.0, 250.0, 1000.0), FS, 2);
        let spectrum = PowerSpectrum::new(&noise, FS);
        let total = spectrum.mean_square();
        let inside = spectrum.band_mean_square(250.0, 1000.5);
        assert!(inside / total > 0.999);
    }

    #[test]
    fn falls_three_db_per_octave() {
        let noise = pink_noise(&spec(70.0, 62.5, 4000.0), FS, 3);
        let spectrum = PowerSpectrum::new(&noise, FS);
        // octave bands carry equal energy
        let plan = BandPlan::new(125.0, 2000.0, 1.0, 0.0);
        let levels = plan.band_levels(&spectrum);
        for pair in levels.windows(2) {
            assert!((pair[0] - pair[1]).abs() < 0.3);
        }
    }

    #[test]
    fn deterministic_per_seed() {
        let a = pink_noise(&spec(70.0, 31.25, 62.5), FS, 7);
        let b = pink_noise(&spec(70.0, 31.25, 62.5), FS, 7);
        let c = pink_noise(&spec(70.0, 31.25, 62.5), FS, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn narrow_band_still_sounds() {
        let mut narrow = spec(70.0, 1000.2, 1000.4);
        narrow.period = 0.01;
        let noise = pink_noise(&narrow, FS, 1);
        assert_eq!(noise.len(), 480);
        assert!(noise.iter().any(|&x| x != 0.0));
    }
}
