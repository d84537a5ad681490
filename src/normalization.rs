//! Turns measured speaker levels into speaker gains.
//!
//! Every speaker is attenuated down to the level of the quietest broadband
//! speaker, then the whole array (broadband speakers and subwoofers) is
//! scaled so that its largest gain is exactly 1. The correction filters are
//! refitted from the curves of the response pass, which are not measured
//! again.

use log::info;

use crate::{
    engine::SpeakerReceiver,
    layout::{SpeakerEntry, SpeakerGroup},
    measurement::ResponseMeasurement,
};

/// Statistics of the broadband speaker levels, in dB.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LevelStats {
    /// Level of the quietest speaker
    pub lmin: f64,
    /// Level of the loudest speaker
    pub lmax: f64,
    /// Mean of the speaker levels
    pub lmean: f64,
}

impl LevelStats {
    /// None for an empty slice.
    pub fn from_levels(levels: &[f64]) -> Option<Self> {
        let first = *levels.first()?;
        let (lmin, lmax, sum) = levels
            .iter()
            .fold((first, first, 0.0), |(lo, hi, sum), &l| (lo.min(l), hi.max(l), sum + l));
        Some(Self {
            lmin,
            lmax,
            lmean: sum / levels.len() as f64,
        })
    }
}

/// Gains of the last tracked receiver after normalisation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppliedGains {
    /// Statistics of the broadband levels
    pub stats: LevelStats,
    /// Linear gain per broadband speaker
    pub speakers: Vec<f64>,
    /// Linear gain per subwoofer
    pub subs: Vec<f64>,
}

fn apply_correction(
    entries: &mut [SpeakerEntry],
    response: &ResponseMeasurement,
    sample_rate: f64,
) {
    for (k, entry) in entries.iter_mut().enumerate() {
        match response.gains.get(k) {
            Some(gains) if response.stages > 0 => entry.set_correction(
                response.stages,
                response.freqs.clone(),
                gains.clone(),
                sample_rate,
            ),
            _ => entry.clear_correction(sample_rate),
        }
    }
}

/// Applies measured `levels` (broadband) and `sub_levels` to every receiver
/// in `receivers`, keeping them identical, and refits their correction
/// filters from `broadband` and `sub`.
pub fn normalize_and_apply(
    levels: &[f64],
    sub_levels: &[f64],
    receivers: &[SpeakerReceiver],
    broadband: &ResponseMeasurement,
    sub: &ResponseMeasurement,
    sample_rate: f64,
) -> AppliedGains {
    let stats = LevelStats::from_levels(levels)
        .or_else(|| LevelStats::from_levels(sub_levels))
        .unwrap_or_default();
    info!(
        "levels: min {:.2} dB, max {:.2} dB, mean {:.2} dB",
        stats.lmin, stats.lmax, stats.lmean
    );

    let mut applied = AppliedGains {
        stats,
        ..Default::default()
    };
    for receiver in receivers {
        applied = receiver.update(|array| {
            for (entry, level) in array.speakers.iter_mut().zip(levels) {
                entry.gain *= 10.0_f64.powf(0.05 * (stats.lmin - level));
            }
            for (entry, level) in array.subs.iter_mut().zip(sub_levels) {
                entry.gain *= 10.0_f64.powf(0.05 * (stats.lmin - level));
            }

            let max_gain = array.entries().map(|e| e.gain).fold(0.0, f64::max);
            if max_gain > 0.0 {
                for entry in array.entries_mut() {
                    entry.gain /= max_gain;
                }
            }

            apply_correction(array.group_mut(SpeakerGroup::Broadband), broadband, sample_rate);
            apply_correction(array.group_mut(SpeakerGroup::Subwoofer), sub, sample_rate);

            AppliedGains {
                stats,
                speakers: array.speakers.iter().map(|e| e.gain).collect(),
                subs: array.subs.iter().map(|e| e.gain).collect(),
            }
        });
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Direction, SpeakerArray};

    const FS: f64 = 48000.0;

    fn receiver(speakers: usize, subs: usize) -> SpeakerReceiver {
        let entry = || SpeakerEntry::new(Direction::FRONT);
        SpeakerReceiver::new(
            "nsp",
            SpeakerArray::new((0..speakers).map(|_| entry()).collect(), (0..subs).map(|_| entry()).collect()),
        )
    }

    fn no_response() -> ResponseMeasurement {
        ResponseMeasurement::default()
    }

    #[test]
    fn stats() {
        let s = LevelStats::from_levels(&[70.0, 65.0, 66.0]).unwrap();
        assert_eq!(s.lmin, 65.0);
        assert_eq!(s.lmax, 70.0);
        assert!((s.lmean - 67.0).abs() < 1e-12);
        assert!(LevelStats::from_levels(&[]).is_none());
    }

    #[test]
    fn louder_speaker_is_attenuated() {
        let r = receiver(2, 0);
        let applied = normalize_and_apply(&[70.0, 65.0], &[], &[r.clone()], &no_response(), &no_response(), FS);
        // 10^((65-70)/20) : 10^((65-65)/20)
        assert!((applied.speakers[0] - 0.562_341).abs() < 1e-6);
        assert_eq!(applied.speakers[1], 1.0);
        assert_eq!(r.read().speakers[0].gain, applied.speakers[0]);
    }

    #[test]
    fn maximum_gain_is_one_across_speakers_and_subs() {
        let r = receiver(3, 2);
        r.update(|a| {
            a.speakers[0].gain = 0.3;
            a.subs[1].gain = 4.0;
        });
        let applied = normalize_and_apply(
            &[71.0, 68.5, 69.0],
            &[60.0, 75.0],
            &[r],
            &no_response(),
            &no_response(),
            FS,
        );
        let max = applied
            .speakers
            .iter()
            .chain(&applied.subs)
            .cloned()
            .fold(f64::MIN, f64::max);
        assert!((max - 1.0).abs() < 1e-12);
    }

    #[test]
    fn gains_order_opposite_to_levels() {
        let levels = [72.0, 66.0, 69.5, 66.0, 70.1];
        let r = receiver(levels.len(), 0);
        let applied = normalize_and_apply(&levels, &[], &[r], &no_response(), &no_response(), FS);
        for i in 0..levels.len() {
            for j in 0..levels.len() {
                if levels[i] > levels[j] {
                    assert!(applied.speakers[i] < applied.speakers[j]);
                } else if levels[i] == levels[j] {
                    assert_eq!(applied.speakers[i], applied.speakers[j]);
                }
            }
        }
    }

    #[test]
    fn tracked_receivers_stay_in_sync() {
        let a = receiver(2, 1);
        let b = receiver(2, 1);
        let response = ResponseMeasurement {
            stages: 1,
            freqs: vec![250.0, 500.0, 1000.0, 2000.0],
            gains: vec![vec![0.0, -3.0, -1.0, 0.0], vec![-2.0, 0.0, -1.0, -4.0]],
        };
        normalize_and_apply(&[70.0, 68.0], &[64.0], &[a.clone(), b.clone()], &response, &no_response(), FS);
        assert_eq!(a.read().speakers, b.read().speakers);
        assert_eq!(a.read().subs, b.read().subs);
        let array = a.read();
        assert_eq!(array.speakers[1].eq_gain, response.gains[1]);
        assert_eq!(array.speakers[1].eq_stages, 1);
        assert_eq!(array.subs[0].eq_stages, 0);
        assert!(array.subs[0].eq_freq.is_empty());
    }

    #[test]
    fn zero_stages_clear_the_curves() {
        let r = receiver(1, 0);
        r.update(|a| {
            let e = &mut a.speakers[0];
            e.set_correction(1, vec![100.0, 200.0], vec![0.0, -2.0], FS);
        });
        normalize_and_apply(&[70.0], &[], &[r.clone()], &no_response(), &no_response(), FS);
        let array = r.read();
        assert_eq!(array.speakers[0].eq_stages, 0);
        assert!(array.speakers[0].eq.is_identity());
        assert!(array.speakers[0].eq_gain.is_empty());
    }
}
