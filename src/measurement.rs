//! Level and frequency response measurement of one speaker group.
//!
//! Both passes walk the speakers in array order. For every speaker the
//! stimulus source is moved to the speaker's direction, the stimulus is
//! given `prewait` seconds to settle, and all reference microphones are
//! captured together with a loopback channel that carries the dry
//! stimulus. Only one speaker is ever measured at a time, since the source
//! position is a single piece of shared state.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
    time::Duration,
};

use log::{debug, info, warn};
use rustfft::FftPlanner;

use crate::{
    engine::{RenderEngine, SourceId, SpeakerReceiver},
    error::CalibError,
    layout::SpeakerGroup,
    params::CalibParams,
    recording_writer::Take,
    spectrum::{level_db, BandPlan, PowerSpectrum, Weighting},
    TransposableIter,
};

/// Which pass a measurement is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Frequency response and correction filter fit
    Response,
    /// Weighted level
    Level,
}

/// Reported before each speaker is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Group being measured
    pub group: SpeakerGroup,
    /// Pass being run
    pub pass: Pass,
    /// Index of the speaker about to be measured
    pub speaker: usize,
    /// Number of speakers in the group
    pub count: usize,
}

/// Result of a frequency response pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponseMeasurement {
    /// Number of correction stages fitted to every speaker, 0 if the pass
    /// was skipped
    pub stages: usize,
    /// Band centre frequencies in Hz
    pub freqs: Vec<f32>,
    /// Correction curve per speaker, in dB, with a maximum of 0 dB
    pub gains: Vec<Vec<f32>>,
}

/// Result of a level pass, one value per speaker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LevelMeasurement {
    /// Weighted level in dB SPL, averaged over the microphones
    pub levels: Vec<f64>,
    /// Difference between the largest and smallest band deviation from the
    /// reference, in dB. Diagnostic only.
    pub ranges: Vec<f64>,
}

/// Captures the reference microphones plus the loopback channel.
pub struct Recorder<'a, E: RenderEngine> {
    engine: &'a E,
    ports: Vec<String>,
    abort: Option<Arc<AtomicBool>>,
    dump: Option<Sender<Take>>,
}

impl<'a, E: RenderEngine> Recorder<'a, E> {
    /// `mic_ports` are the reference microphones; `loopback` is appended as
    /// the last channel of every capture.
    pub fn new(engine: &'a E, mic_ports: &[String], loopback: &str) -> Self {
        let mut ports = mic_ports.to_vec();
        ports.push(loopback.to_string());
        Self {
            engine,
            ports,
            abort: None,
            dump: None,
        }
    }

    /// Checked before every speaker; once set, the measurement stops with
    /// [CalibError::Aborted].
    pub fn with_abort(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    /// Sends a copy of every capture to `dump`.
    pub fn with_dump(mut self, dump: Sender<Take>) -> Self {
        self.dump = Some(dump);
        self
    }

    /// Every captured port, the loopback last.
    pub fn ports(&self) -> &[String] {
        &self.ports
    }

    /// Sample rate of the engine.
    pub fn sample_rate(&self) -> f64 {
        self.engine.sample_rate()
    }

    fn check_abort(&self) -> Result<(), CalibError> {
        match &self.abort {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(CalibError::Aborted),
            _ => Ok(()),
        }
    }

    /// Blocks until `duration` seconds are captured on every port.
    pub fn capture(&self, duration: f64, label: &str) -> Result<Vec<Vec<f32>>, CalibError> {
        let samples = (self.engine.sample_rate() * duration) as usize;
        let mut buffers = vec![vec![0.0_f32; samples]; self.ports.len()];
        self.engine.record(&self.ports, &mut buffers)?;

        if let Some(dump) = &self.dump {
            let take = Take {
                label: label.to_string(),
                sample_rate: self.engine.sample_rate().round() as u32,
                channels: buffers.clone(),
            };
            if dump.send(take).is_err() {
                warn!("recording writer is gone, capture '{}' not saved", label);
            }
        }
        Ok(buffers)
    }

    /// Moves the stimulus to speaker `k`, waits, and captures.
    fn capture_speaker(
        &self,
        speakers: &SpeakerReceiver,
        group: SpeakerGroup,
        source: SourceId,
        k: usize,
        params: &CalibParams,
        label: &str,
    ) -> Result<Vec<Vec<f32>>, CalibError> {
        let direction = speakers
            .read()
            .group(group)
            .get(k)
            .map(|entry| entry.direction)
            .ok_or_else(|| CalibError::Topology(format!("speaker {} vanished from the array", k)))?;
        self.engine.set_source_position(source, direction)?;
        spin_sleep::sleep(Duration::from_secs_f64(params.prewait));
        self.capture(params.duration, label)
    }
}

/// Level and band deviations of one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureAnalysis {
    /// Weighted level averaged over the microphones, in dB SPL
    pub level_db: f64,
    /// Microphone band level minus reference band level, in dB
    pub offsets_db: Vec<f64>,
}

impl CaptureAnalysis {
    /// Largest minus smallest band offset.
    pub fn range_db(&self) -> f64 {
        let max = self.offsets_db.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = self.offsets_db.iter().cloned().fold(f64::INFINITY, f64::min);
        if self.offsets_db.is_empty() {
            0.0
        } else {
            max - min
        }
    }

    /// The filter that flattens this response: the negated offsets, shifted
    /// so that the loudest band is left alone and the others are cut.
    pub fn correction_db(&self) -> Vec<f32> {
        let max = self
            .offsets_db
            .iter()
            .map(|o| -o)
            .fold(f64::NEG_INFINITY, f64::max);
        self.offsets_db.iter().map(|o| (-o - max) as f32).collect()
    }
}

/// Analyses a capture whose last buffer is the loopback reference. Mean
/// squares are averaged over the microphones in the linear domain.
pub fn analyse_capture(
    planner: &mut FftPlanner<f64>,
    buffers: &[Vec<f32>],
    plan: &BandPlan,
    weighting: Weighting,
    sample_rate: f64,
) -> CaptureAnalysis {
    let Some((reference, mics)) = buffers.split_last() else {
        return CaptureAnalysis {
            level_db: level_db(0.0),
            offsets_db: vec![0.0; plan.len()],
        };
    };
    let band_powers = |signal: &[f32], planner: &mut FftPlanner<f64>| -> (f64, Vec<f64>) {
        let spectrum = PowerSpectrum::with_planner(planner, signal, sample_rate);
        let bands = (0..plan.len())
            .map(|k| {
                let (lower, upper) = plan.edges(k);
                spectrum.band_mean_square(lower, upper)
            })
            .collect();
        (spectrum.weighted_mean_square(weighting), bands)
    };

    let per_mic: Vec<(f64, Vec<f64>)> = mics.iter().map(|m| band_powers(m, planner)).collect();
    let n = per_mic.len().max(1) as f64;
    let mean_square = per_mic.iter().map(|(ms, _)| ms).sum::<f64>() / n;
    let mic_bands: Vec<f64> = if per_mic.is_empty() {
        vec![0.0; plan.len()]
    } else {
        per_mic
            .into_iter()
            .map(|(_, bands)| bands)
            .transpose()
            .map(|band| band.iter().sum::<f64>() / n)
            .collect()
    };
    let (_, ref_bands) = band_powers(reference, planner);

    CaptureAnalysis {
        level_db: level_db(mean_square),
        offsets_db: mic_bands
            .iter()
            .zip(&ref_bands)
            .map(|(&m, &r)| level_db(m) - level_db(r))
            .collect(),
    }
}

fn group_name(group: SpeakerGroup) -> &'static str {
    match group {
        SpeakerGroup::Broadband => "speaker",
        SpeakerGroup::Subwoofer => "sub",
    }
}

/// Measures the frequency response of every speaker of `group` and installs
/// a correction filter on it, for the level pass that follows. Does nothing
/// when `params.maxeqstages` is 0.
pub fn measure_response<E: RenderEngine>(
    speakers: &SpeakerReceiver,
    group: SpeakerGroup,
    source: SourceId,
    recorder: &Recorder<'_, E>,
    params: &CalibParams,
    progress: &mut dyn FnMut(Progress),
) -> Result<ResponseMeasurement, CalibError> {
    if params.maxeqstages == 0 {
        return Ok(ResponseMeasurement::default());
    }
    let fs = recorder.sample_rate();
    let plan = BandPlan::new(params.fmin, params.fmax, params.bandsperoctave, params.bandoverlap);
    let freqs: Vec<f32> = plan.centres().iter().map(|&f| f as f32).collect();
    let stages = (plan.len().saturating_sub(1) / 3).min(params.maxeqstages);
    let count = speakers.read().group(group).len();
    let mut planner = FftPlanner::new();
    let mut gains = Vec::with_capacity(count);

    info!(
        "measuring {} frequency responses, {} bands, {} stages",
        group_name(group),
        plan.len(),
        stages
    );
    for k in 0..count {
        recorder.check_abort()?;
        progress(Progress {
            group,
            pass: Pass::Response,
            speaker: k,
            count,
        });
        // measure the speaker without its previous correction
        speakers.update(|array| array.group_mut(group)[k].eq_stages = 0);

        let label = format!("{}-response-{:02}", group_name(group), k);
        let buffers = recorder.capture_speaker(speakers, group, source, k, params, &label)?;
        let analysis = analyse_capture(&mut planner, &buffers, &plan, Weighting::Z, fs);
        let correction = analysis.correction_db();
        debug!("{} {} band offsets: {:?}", group_name(group), k, analysis.offsets_db);

        speakers.update(|array| {
            let entry = &mut array.group_mut(group)[k];
            entry.set_correction(stages, freqs.clone(), correction.clone(), fs);
            debug!("{} {} {}", group_name(group), k, entry.eq);
        });
        gains.push(correction);
    }

    Ok(ResponseMeasurement {
        stages,
        freqs,
        gains,
    })
}

/// Measures the weighted level of every speaker of `group`.
pub fn measure_levels<E: RenderEngine>(
    speakers: &SpeakerReceiver,
    group: SpeakerGroup,
    source: SourceId,
    recorder: &Recorder<'_, E>,
    weighting: Weighting,
    params: &CalibParams,
    progress: &mut dyn FnMut(Progress),
) -> Result<LevelMeasurement, CalibError> {
    let fs = recorder.sample_rate();
    let plan = BandPlan::new(params.fmin, params.fmax, params.bandsperoctave, params.bandoverlap);
    let count = speakers.read().group(group).len();
    let mut planner = FftPlanner::new();
    let mut result = LevelMeasurement {
        levels: Vec::with_capacity(count),
        ranges: Vec::with_capacity(count),
    };

    for k in 0..count {
        recorder.check_abort()?;
        progress(Progress {
            group,
            pass: Pass::Level,
            speaker: k,
            count,
        });

        let label = format!("{}-level-{:02}", group_name(group), k);
        let buffers = recorder.capture_speaker(speakers, group, source, k, params, &label)?;
        let analysis = analyse_capture(&mut planner, &buffers, &plan, weighting, fs);
        info!(
            "{} {}: {:.2} dB, band range {:.2} dB",
            group_name(group),
            k,
            analysis.level_db,
            analysis.range_db()
        );
        result.levels.push(analysis.level_db);
        result.ranges.push(analysis.range_db());
    }

    Ok(result)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        engine::{EngineError, ObjectRef, ReceiverId, RouteSpec, SceneSpec},
        layout::{Direction, SpeakerArray, SpeakerEntry},
        spectrum::P_REF,
    };
    use parking_lot::Mutex;
    use std::f64::consts::PI;

    /// Plays a fixed tone on every port, optionally scaled per speaker
    /// direction, and records what the pipeline asks of it.
    pub(crate) struct MockEngine {
        pub positions: Mutex<Vec<Direction>>,
        /// Microphone level in dB SPL per speaker azimuth (rounded degrees)
        pub level_by_azimuth: Vec<(i64, f64)>,
        pub reference_db: f64,
        pub mutes: Mutex<Vec<(ObjectRef, bool)>>,
        pub caliblevel: Mutex<Vec<f64>>,
        pub diffusegain: Mutex<Vec<f64>>,
        pub receivers: Vec<Option<SpeakerReceiver>>,
        pub sources: usize,
        /// Frequency of the tone on every port
        pub tone_hz: f64,
    }

    impl MockEngine {
        pub(crate) fn new(level_by_azimuth: Vec<(i64, f64)>) -> Self {
            Self {
                positions: Mutex::new(Vec::new()),
                level_by_azimuth,
                reference_db: 70.0,
                mutes: Mutex::new(Vec::new()),
                caliblevel: Mutex::new(vec![P_REF * 10f64.powf(93.0 / 20.0); 3]),
                diffusegain: Mutex::new(vec![1.0; 3]),
                receivers: Vec::new(),
                sources: 2,
                tone_hz: 1000.0,
            }
        }

        fn level_for(&self, direction: Option<Direction>) -> f64 {
            let az = direction.map(|d| d.azimuth().round() as i64).unwrap_or(0);
            self.level_by_azimuth
                .iter()
                .find(|(a, _)| *a == az)
                .map(|(_, l)| *l)
                .unwrap_or(self.reference_db)
        }
    }

    pub(crate) fn tone_at(level_db: f64, freq: f64, n: usize) -> Vec<f32> {
        let amplitude = P_REF * 10f64.powf(level_db / 20.0) * 2f64.sqrt();
        (0..n)
            .map(|i| (amplitude * (2.0 * PI * freq * i as f64 / 48000.0).sin()) as f32)
            .collect()
    }

    impl RenderEngine for MockEngine {
        fn sample_rate(&self) -> f64 {
            48000.0
        }
        fn load_scene(&mut self, _scene: SceneSpec) -> Result<(), EngineError> {
            Ok(())
        }
        fn add_module(&mut self, _route: RouteSpec) -> Result<(), EngineError> {
            Ok(())
        }
        fn source_count(&self) -> usize {
            self.sources
        }
        fn receiver_count(&self) -> usize {
            self.receivers.len()
        }
        fn speaker_receiver(&self, id: ReceiverId) -> Result<SpeakerReceiver, EngineError> {
            match self.receivers.get(id.0) {
                Some(Some(handle)) => Ok(handle.clone()),
                Some(None) => Err(EngineError::NotSpeakerCapable(format!("{}", id.0))),
                None => Err(EngineError::UnknownObject(format!("receiver {}", id.0))),
            }
        }
        fn set_mute(&self, object: ObjectRef, muted: bool) -> Result<(), EngineError> {
            self.mutes.lock().push((object, muted));
            Ok(())
        }
        fn set_source_position(&self, _id: SourceId, direction: Direction) -> Result<(), EngineError> {
            self.positions.lock().push(direction);
            Ok(())
        }
        fn caliblevel(&self, id: ReceiverId) -> Result<f64, EngineError> {
            Ok(self.caliblevel.lock()[id.0])
        }
        fn set_caliblevel(&self, id: ReceiverId, pascal: f64) -> Result<(), EngineError> {
            self.caliblevel.lock()[id.0] = pascal;
            Ok(())
        }
        fn diffusegain(&self, id: ReceiverId) -> Result<f64, EngineError> {
            Ok(self.diffusegain.lock()[id.0])
        }
        fn set_diffusegain(&self, id: ReceiverId, gain: f64) -> Result<(), EngineError> {
            self.diffusegain.lock()[id.0] = gain;
            Ok(())
        }
        fn record(&self, ports: &[String], buffers: &mut [Vec<f32>]) -> Result<(), EngineError> {
            let level = self.level_for(self.positions.lock().last().copied());
            let n = buffers.first().map(Vec::len).unwrap_or(0);
            let last = ports.len().saturating_sub(1);
            for (ch, buffer) in buffers.iter_mut().enumerate() {
                let l = if ch == last { self.reference_db } else { level };
                buffer.copy_from_slice(&tone_at(l, self.tone_hz, n));
            }
            Ok(())
        }
    }

    pub(crate) fn quick_params(is_sub: bool) -> CalibParams {
        let mut params = CalibParams::new(is_sub);
        params.prewait = 0.001;
        params.duration = 0.1;
        params
    }

    fn array(azimuths: &[f64]) -> SpeakerReceiver {
        let speakers = azimuths
            .iter()
            .map(|&az| SpeakerEntry::new(Direction::from_degrees(az, 0.0)))
            .collect();
        SpeakerReceiver::new("nsp", SpeakerArray::new(speakers, vec![]))
    }

    fn mic_ports(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("system:capture_{}", i)).collect()
    }

    #[test]
    fn identical_channels_give_equal_levels_and_no_range() {
        let engine = MockEngine::new(vec![]);
        let ports = mic_ports(3);
        let recorder = Recorder::new(&engine, &ports, "render.calib:ref.0");
        let speakers = array(&[0.0, 90.0, 180.0, -90.0]);
        let mut seen = Vec::new();

        let result = measure_levels(
            &speakers,
            SpeakerGroup::Broadband,
            SourceId(0),
            &recorder,
            Weighting::C,
            &quick_params(false),
            &mut |p| seen.push(p.speaker),
        )
        .unwrap();

        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(result.levels.len(), 4);
        for level in &result.levels {
            assert!((level - result.levels[0]).abs() < 1e-9);
            assert!((level - 70.0).abs() < 0.05);
        }
        assert!(result.ranges.iter().all(|r| r.abs() < 1e-9));
        assert_eq!(engine.positions.lock().len(), 4);
    }

    #[test]
    fn levels_follow_the_speakers() {
        let engine = MockEngine::new(vec![(0, 70.0), (90, 65.0)]);
        let ports = mic_ports(2);
        let recorder = Recorder::new(&engine, &ports, "render.calib:ref.0");
        let speakers = array(&[0.0, 90.0]);
        let result = measure_levels(
            &speakers,
            SpeakerGroup::Broadband,
            SourceId(0),
            &recorder,
            Weighting::Z,
            &quick_params(false),
            &mut |_| {},
        )
        .unwrap();
        assert!((result.levels[0] - 70.0).abs() < 0.05);
        assert!((result.levels[1] - 65.0).abs() < 0.05);
    }

    #[test]
    fn response_is_skipped_without_stages() {
        let engine = MockEngine::new(vec![]);
        let ports = mic_ports(1);
        let recorder = Recorder::new(&engine, &ports, "render.calib:ref.0");
        let speakers = array(&[0.0]);
        let result = measure_response(
            &speakers,
            SpeakerGroup::Broadband,
            SourceId(0),
            &recorder,
            &quick_params(false),
            &mut |_| {},
        )
        .unwrap();
        assert_eq!(result, ResponseMeasurement::default());
        assert!(engine.positions.lock().is_empty());
    }

    #[test]
    fn response_installs_filters() {
        let engine = MockEngine::new(vec![]);
        let ports = mic_ports(1);
        let recorder = Recorder::new(&engine, &ports, "render.calib:ref.0");
        let speakers = array(&[0.0, 180.0]);
        speakers.update(|a| a.speakers[1].eq_stages = 4);
        let mut params = quick_params(false);
        params.maxeqstages = 2;

        let result = measure_response(
            &speakers,
            SpeakerGroup::Broadband,
            SourceId(0),
            &recorder,
            &params,
            &mut |_| {},
        )
        .unwrap();

        assert_eq!(result.stages, 2);
        assert_eq!(result.freqs.len(), 19);
        assert_eq!(result.gains.len(), 2);
        let array = speakers.read();
        for (entry, gains) in array.speakers.iter().zip(&result.gains) {
            assert_eq!(entry.eq_stages, 2);
            assert_eq!(&entry.eq_gain, gains);
            assert!(gains.iter().all(|&g| g <= 0.0));
        }
    }

    #[test]
    fn abort_is_checked_between_speakers() {
        let engine = MockEngine::new(vec![]);
        let ports = mic_ports(1);
        let flag = Arc::new(AtomicBool::new(false));
        let recorder = Recorder::new(&engine, &ports, "render.calib:ref.0").with_abort(flag.clone());
        let speakers = array(&[0.0, 90.0, 180.0]);
        let result = measure_levels(
            &speakers,
            SpeakerGroup::Broadband,
            SourceId(0),
            &recorder,
            Weighting::Z,
            &quick_params(false),
            &mut |p| {
                if p.speaker == 1 {
                    flag.store(true, Ordering::SeqCst)
                }
            },
        );
        assert!(matches!(result, Err(CalibError::Aborted)));
        // the second speaker was still captured, the third was not
        assert_eq!(engine.positions.lock().len(), 2);
    }

    #[test]
    fn captures_are_dumped() {
        let engine = MockEngine::new(vec![]);
        let ports = mic_ports(2);
        let (tx, rx) = std::sync::mpsc::channel();
        let recorder = Recorder::new(&engine, &ports, "render.calib:ref.0").with_dump(tx);
        recorder.capture(0.01, "probe").unwrap();
        let take = rx.recv().unwrap();
        assert_eq!(take.label, "probe");
        assert_eq!(take.channels.len(), 3);
        assert_eq!(take.channels[0].len(), 480);
    }

    #[test]
    fn correction_curve_peaks_at_zero() {
        let analysis = CaptureAnalysis {
            level_db: 70.0,
            offsets_db: vec![-2.0, 1.0, 3.0, 0.0],
        };
        assert_eq!(analysis.range_db(), 5.0);
        assert_eq!(analysis.correction_db(), vec![0.0, -3.0, -5.0, -2.0]);
    }
}
