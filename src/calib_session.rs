//! The calibration session: builds a calibration scene around a speaker
//! layout, measures and normalises the speakers, lets the operator adjust
//! the reference level and the diffuse gain by ear, and writes the result
//! back into the layout.
//!
//! The scene has two stimulus sources (broadband and subwoofer), a diffuse
//! field with the broadband stimulus, and three receivers:
//!
//! 0. `nsp`, nearest speaker panning on the layout. The speakers are
//!    measured through this receiver, so that every speaker is measured
//!    alone regardless of the rendering method being calibrated.
//! 1. `out2`, the receiver type the layout is calibrated for, taken from
//!    its `calibfor` tag. It is used for listening once the speakers are
//!    levelled.
//! 2. `ref`, an omni receiver whose output is the dry stimulus, captured
//!    next to the microphones as the reference.
//!
//! Gains and filters of receivers 0 and 1 are always changed together.

use std::{
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, mpsc::Sender, Arc},
};

use log::{info, warn};

use crate::{
    attr_decoder::decode_calibfor,
    engine::{
        DiffuseId, DiffuseSpec, EngineError, ObjectRef, ReceiverId, ReceiverSpec, RenderEngine,
        RouteSpec, SceneSpec, SourceId, SourceSpec, SpeakerReceiver, StimulusSpec,
    },
    error::CalibError,
    layout::{read_calibfor, Direction, SpeakerArray, SpeakerGroup},
    measurement::{
        measure_levels, measure_response, LevelMeasurement, Progress, Recorder,
        ResponseMeasurement,
    },
    normalization::{normalize_and_apply, LevelStats},
    params::CalibParams,
    persistence::{save_calibration, CalibrationSnapshot},
    recording_writer::Take,
    spectrum::{Weighting, P_REF},
};

/// Name of the calibration scene.
pub const SCENE_NAME: &str = "calib";
/// Port of the omni receiver, appended to the microphone ports.
pub const REFERENCE_PORT: &str = "render.calib:ref.0";
/// Used when the layout has no `calibfor` tag.
pub const DEFAULT_CALIBFOR: &str = "type:nsp";

const BROADBAND_SOURCE: SourceId = SourceId(0);
const SUB_SOURCE: SourceId = SourceId(1);
const NSP_RECEIVER: ReceiverId = ReceiverId(0);
const TARGET_RECEIVER: ReceiverId = ReceiverId(1);
const DIFFUSE_FIELD: DiffuseId = DiffuseId(0);

fn stimulus(params: &CalibParams) -> StimulusSpec {
    StimulusSpec {
        level: params.reflevel,
        period: params.duration,
        fmin: params.fmin,
        fmax: params.fmax,
    }
}

/// The scene every calibration session renders.
pub fn calibration_scene(
    layout: &Path,
    target_attrs: Vec<(String, String)>,
    par_speaker: &CalibParams,
    par_sub: &CalibParams,
) -> SceneSpec {
    SceneSpec {
        name: SCENE_NAME.to_string(),
        sources: vec![
            SourceSpec {
                name: "src".to_string(),
                muted: true,
                stimulus: stimulus(par_speaker),
            },
            SourceSpec {
                name: "srcsub".to_string(),
                muted: true,
                stimulus: stimulus(par_sub),
            },
        ],
        diffuse: vec![DiffuseSpec {
            name: "diffuse".to_string(),
            muted: true,
            stimulus: stimulus(par_speaker),
        }],
        receivers: vec![
            ReceiverSpec {
                name: "nsp".to_string(),
                attrs: vec![("type".to_string(), "nsp".to_string())],
                layout: Some(layout.to_path_buf()),
                muted: false,
            },
            ReceiverSpec {
                name: "out2".to_string(),
                attrs: target_attrs,
                layout: Some(layout.to_path_buf()),
                muted: true,
            },
            ReceiverSpec {
                name: "ref".to_string(),
                attrs: vec![("type".to_string(), "omni".to_string())],
                layout: None,
                muted: false,
            },
        ],
    }
}

/// Monitor routes that play the two stimuli on their own ports.
pub fn monitor_routes(par_speaker: &CalibParams, par_sub: &CalibParams) -> [RouteSpec; 2] {
    [
        RouteSpec {
            name: "pink".to_string(),
            channels: 1,
            stimulus: stimulus(par_speaker),
        },
        RouteSpec {
            name: "sub".to_string(),
            channels: 1,
            stimulus: stimulus(par_sub),
        },
    ]
}

fn speaker_capable<E: RenderEngine>(engine: &E, id: ReceiverId) -> Result<SpeakerReceiver, CalibError> {
    engine.speaker_receiver(id).map_err(|e| match e {
        EngineError::NotSpeakerCapable(name) => {
            CalibError::Topology(format!("receiver '{}' is not a speaker based receiver", name))
        }
        e => CalibError::Engine(e),
    })
}

/// Results of one complete measurement.
struct Measured {
    response: ResponseMeasurement,
    levels: LevelMeasurement,
    sub_response: ResponseMeasurement,
    sub_levels: LevelMeasurement,
}

/// A speaker layout under calibration on a rendering engine.
pub struct CalibSession<E: RenderEngine> {
    engine: E,
    layout_path: PathBuf,
    ref_ports: Vec<String>,
    par_speaker: CalibParams,
    par_sub: CalibParams,
    calibfor: String,
    /// The nsp receiver, then the target receiver
    receivers: [SpeakerReceiver; 2],

    start_level_db: f64,
    start_diffgain_db: f64,
    delta: f64,
    delta_diff: f64,

    levels: LevelMeasurement,
    sub_levels: LevelMeasurement,
    response: ResponseMeasurement,
    sub_response: ResponseMeasurement,
    stats: LevelStats,

    levels_recorded: bool,
    calibrated: bool,
    calibrated_diff: bool,
    gain_modified: bool,

    abort: Option<Arc<AtomicBool>>,
    dump: Option<Sender<Take>>,
}

impl<E: RenderEngine> CalibSession<E> {
    /// Builds the calibration scene for the layout at `layout_path` on
    /// `engine`. `ref_ports` are the capture ports of the reference
    /// microphones.
    pub fn new(
        mut engine: E,
        layout_path: impl AsRef<Path>,
        ref_ports: Vec<String>,
        par_speaker: CalibParams,
        par_sub: CalibParams,
    ) -> Result<Self, CalibError> {
        let layout_path = layout_path.as_ref().to_path_buf();
        par_speaker.validate()?;
        par_sub.validate()?;

        let calibfor = read_calibfor(&layout_path)?.unwrap_or_else(|| DEFAULT_CALIBFOR.to_string());
        let target_attrs = decode_calibfor(&calibfor)
            .map_err(|_| CalibError::InvalidCalibFor(calibfor.clone()))?
            .into_iter()
            .map(|attr| (attr.name, attr.value))
            .collect();

        engine.load_scene(calibration_scene(&layout_path, target_attrs, &par_speaker, &par_sub))?;
        for route in monitor_routes(&par_speaker, &par_sub) {
            engine.add_module(route)?;
        }

        if engine.source_count() != 2 {
            return Err(CalibError::Topology(format!(
                "not exactly two sources ({})",
                engine.source_count()
            )));
        }
        if engine.receiver_count() != 3 {
            return Err(CalibError::Topology(format!(
                "not exactly three receivers ({})",
                engine.receiver_count()
            )));
        }
        engine.set_source_position(BROADBAND_SOURCE, Direction::FRONT)?;
        let receivers = [
            speaker_capable(&engine, NSP_RECEIVER)?,
            speaker_capable(&engine, TARGET_RECEIVER)?,
        ];

        let start_level_db = 20.0 * (engine.caliblevel(TARGET_RECEIVER)? / P_REF).log10();
        let start_diffgain_db = 20.0 * engine.diffusegain(TARGET_RECEIVER)?.log10();

        // start from uncorrected speakers
        for receiver in &receivers {
            receiver.update(|array| {
                for entry in array.entries_mut() {
                    entry.eq_stages = 0;
                }
            });
        }

        let (speakers, subs) = {
            let array = receivers[0].read();
            (array.speakers.len(), array.subs.len())
        };
        info!(
            "calibration session for {} ({}): {} speakers, {} subs",
            layout_path.display(),
            calibfor,
            speakers,
            subs
        );

        Ok(Self {
            engine,
            layout_path,
            ref_ports,
            par_speaker,
            par_sub,
            calibfor,
            receivers,
            start_level_db,
            start_diffgain_db,
            delta: 0.0,
            delta_diff: 0.0,
            levels: LevelMeasurement {
                levels: vec![0.0; speakers],
                ranges: vec![0.0; speakers],
            },
            sub_levels: LevelMeasurement {
                levels: vec![0.0; subs],
                ranges: vec![0.0; subs],
            },
            response: ResponseMeasurement::default(),
            sub_response: ResponseMeasurement::default(),
            stats: LevelStats::default(),
            levels_recorded: false,
            calibrated: false,
            calibrated_diff: false,
            gain_modified: false,
            abort: None,
            dump: None,
        })
    }

    /// Checked between speakers; setting it makes [Self::measure] fail with
    /// [CalibError::Aborted].
    pub fn set_abort(&mut self, flag: Arc<AtomicBool>) {
        self.abort = Some(flag);
    }

    /// Sends every capture to `dump`, e.g. a
    /// [RecordingWriter](crate::recording_writer::RecordingWriter).
    pub fn set_dump(&mut self, dump: Sender<Take>) {
        self.dump = Some(dump);
    }

    fn mute(&self, object: ObjectRef, muted: bool) -> Result<(), CalibError> {
        Ok(self.engine.set_mute(object, muted)?)
    }

    /// Switches listening between the nsp receiver and the target receiver.
    fn listen_to_target(&self, target: bool) -> Result<(), CalibError> {
        self.mute(ObjectRef::Receiver(NSP_RECEIVER), target)?;
        self.mute(ObjectRef::Receiver(TARGET_RECEIVER), !target)
    }

    fn run_measurement(&self, progress: &mut dyn FnMut(Progress)) -> Result<Measured, CalibError> {
        let mut recorder = Recorder::new(&self.engine, &self.ref_ports, REFERENCE_PORT);
        if let Some(flag) = &self.abort {
            recorder = recorder.with_abort(Arc::clone(flag));
        }
        if let Some(dump) = &self.dump {
            recorder = recorder.with_dump(dump.clone());
        }
        let nsp = &self.receivers[0];

        self.mute(ObjectRef::Source(SUB_SOURCE), true)?;
        self.mute(ObjectRef::Source(BROADBAND_SOURCE), false)?;
        self.listen_to_target(false)?;
        let response = measure_response(
            nsp,
            SpeakerGroup::Broadband,
            BROADBAND_SOURCE,
            &recorder,
            &self.par_speaker,
            progress,
        )?;
        let levels = measure_levels(
            nsp,
            SpeakerGroup::Broadband,
            BROADBAND_SOURCE,
            &recorder,
            Weighting::C,
            &self.par_speaker,
            progress,
        )?;

        let mut measured = Measured {
            response,
            levels,
            sub_response: ResponseMeasurement::default(),
            sub_levels: LevelMeasurement::default(),
        };
        if !nsp.read().subs.is_empty() {
            self.mute(ObjectRef::Source(BROADBAND_SOURCE), true)?;
            self.mute(ObjectRef::Source(SUB_SOURCE), false)?;
            measured.sub_response = measure_response(
                nsp,
                SpeakerGroup::Subwoofer,
                SUB_SOURCE,
                &recorder,
                &self.par_sub,
                progress,
            )?;
            measured.sub_levels = measure_levels(
                nsp,
                SpeakerGroup::Subwoofer,
                SUB_SOURCE,
                &recorder,
                Weighting::Z,
                &self.par_sub,
                progress,
            )?;
        }
        Ok(measured)
    }

    /// Mutes both stimuli and puts them back in front.
    fn reset_stimuli(&self) -> Result<(), CalibError> {
        for source in [BROADBAND_SOURCE, SUB_SOURCE] {
            self.mute(ObjectRef::Source(source), true)?;
            self.engine.set_source_position(source, Direction::FRONT)?;
        }
        Ok(())
    }

    /// Measures every speaker and subwoofer and applies the resulting gains
    /// and filters to both speaker receivers.
    pub fn measure(&mut self) -> Result<(), CalibError> {
        self.measure_with(&mut |_| {})
    }

    /// Like [Self::measure], reporting each speaker to `progress` before it
    /// is measured.
    ///
    /// On failure both speaker receivers are put back the way they were.
    pub fn measure_with(&mut self, progress: &mut dyn FnMut(Progress)) -> Result<(), CalibError> {
        let before: Vec<SpeakerArray> = self.receivers.iter().map(|r| r.read().clone()).collect();
        let result = self.run_measurement(progress);
        let reset = self.reset_stimuli();
        let measured = match (result, reset) {
            (Ok(measured), Ok(())) => measured,
            (Ok(_), Err(e)) => {
                self.restore(&before);
                return Err(e);
            }
            (Err(e), reset) => {
                if let Err(reset_error) = reset {
                    warn!("could not reset the stimuli: {}", reset_error);
                }
                self.restore(&before);
                return Err(e);
            }
        };

        let applied = normalize_and_apply(
            &measured.levels.levels,
            &measured.sub_levels.levels,
            &self.receivers,
            &measured.response,
            &measured.sub_response,
            self.engine.sample_rate(),
        );
        self.stats = applied.stats;
        self.levels = measured.levels;
        self.sub_levels = measured.sub_levels;
        self.response = measured.response;
        self.sub_response = measured.sub_response;
        self.levels_recorded = true;
        info!(
            "measured {} speakers and {} subs",
            self.levels.levels.len(),
            self.sub_levels.levels.len()
        );
        Ok(())
    }

    /// Puts the speakers of both receivers back to `arrays`, keeping their
    /// generation counters moving forward.
    fn restore(&self, arrays: &[SpeakerArray]) {
        for (receiver, saved) in self.receivers.iter().zip(arrays) {
            receiver.update(|array| {
                array.speakers = saved.speakers.clone();
                array.subs = saved.subs.clone();
            });
        }
        warn!("measurement failed, speaker gains and filters restored");
    }

    /// Forgets the measured levels and sets every speaker gain back to 1.
    pub fn reset_levels(&mut self) {
        self.levels_recorded = false;
        self.levels.ranges.iter_mut().for_each(|r| *r = 0.0);
        self.sub_levels.ranges.iter_mut().for_each(|r| *r = 0.0);
        for receiver in &self.receivers {
            receiver.update(|array| {
                for entry in array.entries_mut() {
                    entry.gain = 1.0;
                }
            });
        }
    }

    /// Plays the broadband stimulus from the front through the target
    /// receiver, for adjusting the reference level. Deactivates the diffuse
    /// field.
    pub fn set_active(&mut self, active: bool) -> Result<(), CalibError> {
        self.mute(ObjectRef::Source(SUB_SOURCE), true)?;
        if active {
            self.set_active_diffuse(false)?;
        } else {
            self.listen_to_target(false)?;
        }
        self.engine.set_source_position(BROADBAND_SOURCE, Direction::FRONT)?;
        self.mute(ObjectRef::Source(BROADBAND_SOURCE), !active)?;
        if active {
            self.calibrated = true;
            self.listen_to_target(true)?;
        }
        Ok(())
    }

    /// Plays the diffuse field through the target receiver, for adjusting
    /// the diffuse gain. Deactivates the broadband stimulus.
    pub fn set_active_diffuse(&mut self, active: bool) -> Result<(), CalibError> {
        self.mute(ObjectRef::Source(SUB_SOURCE), true)?;
        if active {
            self.set_active(false)?;
        } else {
            self.listen_to_target(false)?;
        }
        self.mute(ObjectRef::Diffuse(DIFFUSE_FIELD), !active)?;
        if active {
            self.calibrated_diff = true;
            self.listen_to_target(true)?;
        }
        Ok(())
    }

    /// Changes the reference level of both speaker receivers by `delta_db`,
    /// relative to its value when the session started.
    pub fn inc_caliblevel(&mut self, delta_db: f64) -> Result<(), CalibError> {
        self.gain_modified = true;
        self.delta += delta_db;
        let pascal = P_REF * 10.0_f64.powf(0.05 * (self.start_level_db + self.delta));
        for id in [NSP_RECEIVER, TARGET_RECEIVER] {
            self.engine.set_caliblevel(id, pascal)?;
        }
        Ok(())
    }

    /// Changes the diffuse gain of both speaker receivers by `delta_db`.
    pub fn inc_diffusegain(&mut self, delta_db: f64) -> Result<(), CalibError> {
        self.gain_modified = true;
        self.delta_diff += delta_db;
        let gain = 10.0_f64.powf(0.05 * (self.start_diffgain_db + self.delta_diff));
        for id in [NSP_RECEIVER, TARGET_RECEIVER] {
            self.engine.set_diffusegain(id, gain)?;
        }
        Ok(())
    }

    /// Reference level of the target receiver in dB SPL.
    pub fn caliblevel_db(&self) -> Result<f64, CalibError> {
        Ok(20.0 * (self.engine.caliblevel(TARGET_RECEIVER)? / P_REF).log10())
    }

    /// Diffuse gain of the target receiver in dB.
    pub fn diffusegain_db(&self) -> Result<f64, CalibError> {
        Ok(20.0 * self.engine.diffusegain(TARGET_RECEIVER)?.log10())
    }

    /// Writes the calibration into the layout the session was built from.
    pub fn save(&mut self) -> Result<(), CalibError> {
        let path = self.layout_path.clone();
        self.save_as(path)
    }

    /// Writes the calibration into a copy of the layout at `path`.
    pub fn save_as(&mut self, path: impl AsRef<Path>) -> Result<(), CalibError> {
        let caliblevel = self.engine.caliblevel(TARGET_RECEIVER)?;
        let diffusegain = self.engine.diffusegain(TARGET_RECEIVER)?;
        {
            let array = self.receivers[1].read();
            save_calibration(
                &self.layout_path,
                path.as_ref(),
                &CalibrationSnapshot {
                    caliblevel,
                    diffusegain,
                    calibfor: &self.calibfor,
                    array: &array,
                    broadband: &self.response,
                    sub: &self.sub_response,
                    speaker_params: &self.par_speaker,
                    sub_params: &self.par_sub,
                },
            )?;
        }
        self.gain_modified = false;
        self.levels_recorded = false;
        self.calibrated = false;
        self.calibrated_diff = false;
        Ok(())
    }

    /// The engine the session renders on.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The layout the session was built from.
    pub fn layout_path(&self) -> &Path {
        &self.layout_path
    }

    /// The `calibfor` tag of the layout, or the default one.
    pub fn calibfor(&self) -> &str {
        &self.calibfor
    }

    /// The nsp receiver, then the target receiver.
    pub fn receivers(&self) -> &[SpeakerReceiver; 2] {
        &self.receivers
    }

    /// Parameters of the broadband measurement.
    pub fn speaker_params(&self) -> &CalibParams {
        &self.par_speaker
    }

    /// Parameters of the subwoofer measurement.
    pub fn sub_params(&self) -> &CalibParams {
        &self.par_sub
    }

    /// Levels of the last measurement, broadband speakers.
    pub fn levels(&self) -> &LevelMeasurement {
        &self.levels
    }

    /// Levels of the last measurement, subwoofers.
    pub fn sub_levels(&self) -> &LevelMeasurement {
        &self.sub_levels
    }

    /// Statistics of the last measured broadband levels.
    pub fn stats(&self) -> LevelStats {
        self.stats
    }

    /// Whether speaker levels were measured since the last save.
    pub fn levels_recorded(&self) -> bool {
        self.levels_recorded
    }

    /// Whether the reference level was adjusted since the last save.
    pub fn calibrated(&self) -> bool {
        self.calibrated
    }

    /// Whether the diffuse gain was adjusted since the last save.
    pub fn calibrated_diffuse(&self) -> bool {
        self.calibrated_diff
    }

    /// Whether the reference level or the diffuse gain changed since the last save.
    pub fn gain_modified(&self) -> bool {
        self.gain_modified
    }

    /// Whether anything changed since the session started or was saved.
    pub fn modified(&self) -> bool {
        self.gain_modified || self.levels_recorded || self.calibrated || self.calibrated_diff
    }
}
