//! An in-process [RenderEngine] that renders the calibration scene into a
//! simulated room, so that calibrations can run without audio hardware.
//!
//! A render thread computes blocks of audio: every unmuted point source is
//! panned to the speaker closest to its direction, diffuse fields are spread
//! over all speakers, speaker gains and correction filters are applied, and
//! the speaker feeds are played into a room that colours each speaker with a
//! seeded sensitivity offset and resonance before they reach the
//! microphones. The thread takes its configuration from shared state with
//! `try_read` only, and keeps rendering with its previous copy whenever the
//! control thread holds a lock.
//!
//! Ports:
//! - `system:capture_<n>`, `n` from 1, the microphones
//! - `render.<scene>:<receiver>.<channel>`, one channel per speaker of a
//!   speaker based receiver (speakers, then subs), or the pressure at the
//!   centre for the omni receiver
//! - `render.<scene>:<route>.<channel>` for auxiliary routes

use std::{
    f64::consts::PI,
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::RwLock;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    engine::{
        EngineError, ObjectRef, ReceiverId, RenderEngine, RouteSpec, SceneSpec, SourceId,
        SpeakerReceiver,
    },
    layout::{Direction, SpeakerArray, SpeakerLayout},
    peq::{MultibandPeq, PeqStage},
    spectrum::P_REF,
    stimulus::pink_noise,
};

/// Receiver types that render to a speaker layout.
pub const SPEAKER_RECEIVER_TYPES: [&str; 3] = ["nsp", "vbap", "hoa2d"];

/// Crossover frequency between speakers and subwoofers, in Hz.
const SUB_CROSSOVER: f64 = 80.0;

/// Settings of the simulated engine and room.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Samples per rendered block
    pub block_size: usize,
    /// Number of microphones
    pub mics: usize,
    /// Pace rendering with the wall clock instead of rendering only while a
    /// capture is waiting
    pub realtime: bool,
    /// Seed of the room and the stimuli
    pub seed: u64,
    /// Speaker sensitivities vary uniformly by this many dB
    pub sensitivity_spread_db: f64,
    /// Largest boost or cut of a speaker resonance, in dB
    pub resonance_db: f64,
    /// Microphone self noise in dB SPL
    pub noise_level_db: f64,
    /// Sound pressure level of a full scale rms feed, in dB SPL
    pub system_level_db: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            block_size: 256,
            mics: 4,
            realtime: false,
            seed: 1,
            sensitivity_spread_db: 3.0,
            resonance_db: 6.0,
            noise_level_db: 20.0,
            system_level_db: 93.0,
        }
    }
}

/// How the simulated room colours each physical speaker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoomModel {
    /// Sensitivity offset per speaker, broadband speakers then subs, in dB
    pub sensitivity_db: Vec<f64>,
    /// Resonance per speaker, same order
    pub resonance: Vec<PeqStage>,
    /// Extra offset of each speaker at each microphone, in dB
    pub mic_db: Vec<Vec<f64>>,
    /// Number of simulated broadband speakers
    pub speakers: usize,
    /// Number of simulated subwoofers
    pub subs: usize,
}

impl RoomModel {
    fn new(config: &SimConfig, speakers: usize, subs: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed ^ 0x5eed_0f_400d);
        let total = speakers + subs;
        let half_spread = 0.5 * config.sensitivity_spread_db;
        let mut sensitivity_db = Vec::with_capacity(total);
        let mut resonance = Vec::with_capacity(total);
        for k in 0..total {
            sensitivity_db.push(if half_spread > 0.0 {
                rng.gen_range(-half_spread..=half_spread)
            } else {
                0.0
            });
            let (lo, hi) = if k < speakers {
                (150.0_f64, 2500.0_f64)
            } else {
                (35.0, 60.0)
            };
            let freq = (lo.ln() + rng.gen::<f64>() * (hi.ln() - lo.ln())).exp();
            let gain_db = if config.resonance_db > 0.0 {
                rng.gen_range(-config.resonance_db..=config.resonance_db)
            } else {
                0.0
            };
            resonance.push(PeqStage {
                freq,
                gain_db,
                q: 2.0,
            });
        }
        let mic_db = (0..config.mics)
            .map(|_| (0..total).map(|_| rng.gen_range(-0.5..=0.5)).collect())
            .collect();
        Self {
            sensitivity_db,
            resonance,
            mic_db,
            speakers,
            subs,
        }
    }
}

#[derive(Debug, Clone)]
enum ReceiverKind {
    Speakers(SpeakerReceiver),
    Omni,
}

#[derive(Debug, Clone)]
struct SimReceiver {
    name: String,
    kind: ReceiverKind,
}

#[derive(Debug, Clone)]
struct SimRoute {
    name: String,
    channels: usize,
    stimulus: Arc<Vec<f32>>,
}

/// Everything fixed by `load_scene` and `add_module`.
#[derive(Debug, Clone, Default)]
struct SceneData {
    name: String,
    sources: Vec<Arc<Vec<f32>>>,
    diffuse: Vec<Arc<Vec<f32>>>,
    receivers: Vec<SimReceiver>,
    routes: Vec<SimRoute>,
    room: RoomModel,
}

/// Shared between the control methods and the render thread.
#[derive(Debug, Clone, Default)]
struct RenderState {
    scene: Arc<SceneData>,
    source_muted: Vec<bool>,
    source_position: Vec<Direction>,
    diffuse_muted: Vec<bool>,
    receiver_muted: Vec<bool>,
    /// Pascal
    caliblevel: Vec<f64>,
    /// Linear
    diffusegain: Vec<f64>,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortRef {
    Mic(usize),
    Receiver(usize, usize),
    Route(usize, usize),
}

type CaptureResult = Result<Vec<Vec<f32>>, EngineError>;

struct CaptureRequest {
    ports: Vec<PortRef>,
    samples: usize,
    reply: mpsc::Sender<CaptureResult>,
}

enum Signal {
    Capture(CaptureRequest),
    Stop,
}

/// The simulated engine. Dropping it stops the render thread.
pub struct SimEngine {
    config: SimConfig,
    handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<Signal>,
    state: Arc<RwLock<RenderState>>,
}

impl SimEngine {
    /// Starts the render thread with an empty scene.
    pub fn new(config: SimConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Signal>();
        let state = Arc::new(RwLock::new(RenderState::default()));
        let mut worker = RenderWorker::new(config.clone(), Arc::clone(&state));

        let handle = thread::spawn(move || worker.run(rx));
        info!(
            "simulated engine running at {} Hz, {} microphones, {}",
            config.sample_rate,
            config.mics,
            if config.realtime { "realtime" } else { "offline" }
        );

        SimEngine {
            config,
            handle: Some(handle),
            tx,
            state,
        }
    }

    /// The configuration the engine was started with.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// The room of the loaded scene.
    pub fn room(&self) -> RoomModel {
        self.state.read().scene.room.clone()
    }

    /// Stops and joins the render thread.
    pub fn stop(&mut self) {
        // the thread may already be gone, then there is nobody to tell
        let _ = self.tx.send(Signal::Stop);
        if let Some(thread) = self.handle.take() {
            if thread.join().is_err() {
                warn!("render thread panicked");
            }
        }
    }

    fn modify(&self, f: impl FnOnce(&mut RenderState) -> Result<(), EngineError>) -> Result<(), EngineError> {
        let mut state = self.state.write();
        f(&mut state)?;
        state.generation = state.generation.wrapping_add(1);
        Ok(())
    }

    fn resolve_port(&self, scene: &SceneData, port: &str) -> Result<PortRef, EngineError> {
        let unknown = || EngineError::UnknownPort(port.to_string());

        if let Some(n) = port.strip_prefix("system:capture_") {
            let n: usize = n.parse().map_err(|_| unknown())?;
            return if n >= 1 && n <= self.config.mics {
                Ok(PortRef::Mic(n - 1))
            } else {
                Err(unknown())
            };
        }

        let rest = port
            .strip_prefix("render.")
            .and_then(|rest| rest.strip_prefix(scene.name.as_str()))
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(unknown)?;
        let (object, channel) = rest.rsplit_once('.').ok_or_else(unknown)?;
        let channel: usize = channel.parse().map_err(|_| unknown())?;

        if let Some(r) = scene.receivers.iter().position(|r| r.name == object) {
            let channels = match &scene.receivers[r].kind {
                ReceiverKind::Speakers(handle) => {
                    let array = handle.read();
                    array.speakers.len() + array.subs.len()
                }
                ReceiverKind::Omni => 1,
            };
            return if channel < channels {
                Ok(PortRef::Receiver(r, channel))
            } else {
                Err(unknown())
            };
        }
        if let Some(i) = scene.routes.iter().position(|r| r.name == object) {
            return if channel < scene.routes[i].channels {
                Ok(PortRef::Route(i, channel))
            } else {
                Err(unknown())
            };
        }
        Err(unknown())
    }
}

impl Drop for SimEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn check_index(len: usize, index: usize, what: &str) -> Result<(), EngineError> {
    if index < len {
        Ok(())
    } else {
        Err(EngineError::UnknownObject(format!("{} {}", what, index)))
    }
}

impl RenderEngine for SimEngine {
    fn sample_rate(&self) -> f64 {
        self.config.sample_rate
    }

    fn load_scene(&mut self, scene: SceneSpec) -> Result<(), EngineError> {
        let fs = self.config.sample_rate;
        let mut receivers = Vec::with_capacity(scene.receivers.len());
        let mut caliblevel = Vec::with_capacity(scene.receivers.len());
        let mut diffusegain = Vec::with_capacity(scene.receivers.len());
        let (mut speakers, mut subs) = (0, 0);

        for spec in &scene.receivers {
            match spec.receiver_type().unwrap_or("omni") {
                "omni" => {
                    receivers.push(SimReceiver {
                        name: spec.name.clone(),
                        kind: ReceiverKind::Omni,
                    });
                    caliblevel.push(P_REF * 10.0_f64.powf(self.config.system_level_db / 20.0));
                    diffusegain.push(1.0);
                }
                t if SPEAKER_RECEIVER_TYPES.contains(&t) => {
                    let path = spec.layout.as_ref().ok_or_else(|| {
                        EngineError::SceneRejected(format!(
                            "receiver '{}' of type '{}' needs a layout",
                            spec.name, t
                        ))
                    })?;
                    let layout = SpeakerLayout::from_path(path, fs).map_err(|e| {
                        EngineError::SceneRejected(format!(
                            "receiver '{}': {}: {}",
                            spec.name,
                            path.display(),
                            e
                        ))
                    })?;
                    speakers = speakers.max(layout.array.speakers.len());
                    subs = subs.max(layout.array.subs.len());
                    caliblevel.push(P_REF * 10.0_f64.powf(layout.caliblevel_db / 20.0));
                    diffusegain.push(10.0_f64.powf(layout.diffusegain_db / 20.0));
                    receivers.push(SimReceiver {
                        name: spec.name.clone(),
                        kind: ReceiverKind::Speakers(SpeakerReceiver::new(
                            spec.name.clone(),
                            layout.array,
                        )),
                    });
                }
                t => {
                    return Err(EngineError::SceneRejected(format!(
                        "receiver '{}' has unsupported type '{}'",
                        spec.name, t
                    )))
                }
            }
        }

        let seed = self.config.seed;
        let data = SceneData {
            name: scene.name.clone(),
            sources: scene
                .sources
                .iter()
                .enumerate()
                .map(|(i, s)| Arc::new(pink_noise(&s.stimulus, fs, seed.wrapping_add(i as u64))))
                .collect(),
            diffuse: scene
                .diffuse
                .iter()
                .enumerate()
                .map(|(i, d)| {
                    Arc::new(pink_noise(&d.stimulus, fs, seed.wrapping_add(1000 + i as u64)))
                })
                .collect(),
            receivers,
            routes: Vec::new(),
            room: RoomModel::new(&self.config, speakers, subs),
        };

        self.modify(|state| {
            *state = RenderState {
                scene: Arc::new(data),
                source_muted: scene.sources.iter().map(|s| s.muted).collect(),
                source_position: vec![Direction::FRONT; scene.sources.len()],
                diffuse_muted: scene.diffuse.iter().map(|d| d.muted).collect(),
                receiver_muted: scene.receivers.iter().map(|r| r.muted).collect(),
                caliblevel,
                diffusegain,
                generation: state.generation,
            };
            Ok(())
        })?;
        debug!(
            "loaded scene '{}': {} sources, {} diffuse, {} receivers, {} speakers, {} subs",
            scene.name,
            scene.sources.len(),
            scene.diffuse.len(),
            scene.receivers.len(),
            speakers,
            subs
        );
        Ok(())
    }

    fn add_module(&mut self, route: RouteSpec) -> Result<(), EngineError> {
        let fs = self.config.sample_rate;
        let seed = self.config.seed;
        self.modify(|state| {
            let mut scene = (*state.scene).clone();
            if scene.receivers.iter().any(|r| r.name == route.name)
                || scene.routes.iter().any(|r| r.name == route.name)
            {
                return Err(EngineError::SceneRejected(format!(
                    "duplicate object name '{}'",
                    route.name
                )));
            }
            let stimulus = pink_noise(
                &route.stimulus,
                fs,
                seed.wrapping_add(2000 + scene.routes.len() as u64),
            );
            scene.routes.push(SimRoute {
                name: route.name.clone(),
                channels: route.channels,
                stimulus: Arc::new(stimulus),
            });
            state.scene = Arc::new(scene);
            Ok(())
        })
    }

    fn source_count(&self) -> usize {
        self.state.read().scene.sources.len()
    }

    fn receiver_count(&self) -> usize {
        self.state.read().scene.receivers.len()
    }

    fn speaker_receiver(&self, id: ReceiverId) -> Result<SpeakerReceiver, EngineError> {
        let state = self.state.read();
        let receiver = state
            .scene
            .receivers
            .get(id.0)
            .ok_or_else(|| EngineError::UnknownObject(format!("receiver {}", id.0)))?;
        match &receiver.kind {
            ReceiverKind::Speakers(handle) => Ok(handle.clone()),
            ReceiverKind::Omni => Err(EngineError::NotSpeakerCapable(receiver.name.clone())),
        }
    }

    fn set_mute(&self, object: ObjectRef, muted: bool) -> Result<(), EngineError> {
        self.modify(|state| {
            let (flags, index, what) = match object {
                ObjectRef::Source(SourceId(i)) => (&mut state.source_muted, i, "source"),
                ObjectRef::Diffuse(d) => (&mut state.diffuse_muted, d.0, "diffuse field"),
                ObjectRef::Receiver(ReceiverId(i)) => (&mut state.receiver_muted, i, "receiver"),
            };
            check_index(flags.len(), index, what)?;
            flags[index] = muted;
            Ok(())
        })
    }

    fn set_source_position(&self, id: SourceId, direction: Direction) -> Result<(), EngineError> {
        self.modify(|state| {
            check_index(state.source_position.len(), id.0, "source")?;
            state.source_position[id.0] = direction;
            Ok(())
        })
    }

    fn caliblevel(&self, id: ReceiverId) -> Result<f64, EngineError> {
        let state = self.state.read();
        check_index(state.caliblevel.len(), id.0, "receiver")?;
        Ok(state.caliblevel[id.0])
    }

    fn set_caliblevel(&self, id: ReceiverId, pascal: f64) -> Result<(), EngineError> {
        self.modify(|state| {
            check_index(state.caliblevel.len(), id.0, "receiver")?;
            state.caliblevel[id.0] = pascal;
            Ok(())
        })
    }

    fn diffusegain(&self, id: ReceiverId) -> Result<f64, EngineError> {
        let state = self.state.read();
        check_index(state.diffusegain.len(), id.0, "receiver")?;
        Ok(state.diffusegain[id.0])
    }

    fn set_diffusegain(&self, id: ReceiverId, gain: f64) -> Result<(), EngineError> {
        self.modify(|state| {
            check_index(state.diffusegain.len(), id.0, "receiver")?;
            state.diffusegain[id.0] = gain;
            Ok(())
        })
    }

    fn record(&self, ports: &[String], buffers: &mut [Vec<f32>]) -> Result<(), EngineError> {
        if ports.len() != buffers.len() {
            return Err(EngineError::CaptureFailed(format!(
                "{} ports but {} buffers",
                ports.len(),
                buffers.len()
            )));
        }
        let samples = buffers.first().map(Vec::len).unwrap_or(0);
        if buffers.iter().any(|b| b.len() != samples) {
            return Err(EngineError::CaptureFailed(
                "buffers differ in length".to_string(),
            ));
        }

        let scene = Arc::clone(&self.state.read().scene);
        let ports = ports
            .iter()
            .map(|p| self.resolve_port(&scene, p))
            .collect::<Result<Vec<_>, _>>()?;
        if samples == 0 {
            return Ok(());
        }

        let (reply, result) = mpsc::channel();
        self.tx
            .send(Signal::Capture(CaptureRequest {
                ports,
                samples,
                reply,
            }))
            .map_err(|_| EngineError::CaptureFailed("render thread is not running".to_string()))?;

        let expected = Duration::from_secs_f64(samples as f64 / self.config.sample_rate);
        let captured = result
            .recv_timeout(expected * 4 + Duration::from_secs(10))
            .map_err(|_| EngineError::CaptureTimeout)??;
        for (buffer, data) in buffers.iter_mut().zip(captured) {
            buffer.copy_from_slice(&data);
        }
        Ok(())
    }
}

struct PendingCapture {
    ports: Vec<PortRef>,
    buffers: Vec<Vec<f32>>,
    samples: usize,
    reply: mpsc::Sender<CaptureResult>,
}

/// Output of one rendered block.
#[derive(Default)]
struct Block {
    mics: Vec<Vec<f32>>,
    receivers: Vec<Vec<Vec<f32>>>,
    routes: Vec<Vec<f32>>,
}

impl Block {
    /// None for a port the block has no output for, e.g. a receiver whose
    /// speakers could not be read yet.
    fn port(&self, port: PortRef) -> Option<&[f32]> {
        match port {
            PortRef::Mic(m) => self.mics.get(m),
            PortRef::Receiver(r, ch) => self.receivers.get(r).and_then(|channels| channels.get(ch)),
            // all channels of a route carry the same stimulus
            PortRef::Route(i, _) => self.routes.get(i),
        }
        .map(Vec::as_slice)
    }
}

impl PendingCapture {
    /// Appends `block` to the capture, silence for ports without output.
    /// Returns whether every buffer is full.
    fn append(&mut self, block: &Block, block_len: usize) -> bool {
        for (buffer, &port) in self.buffers.iter_mut().zip(&self.ports) {
            let remaining = self.samples - buffer.len();
            match block.port(port) {
                Some(data) => buffer.extend_from_slice(&data[..remaining.min(data.len())]),
                None => buffer.resize(buffer.len() + remaining.min(block_len), 0.0),
            }
        }
        self.buffers.iter().all(|b| b.len() == self.samples)
    }
}

struct RenderWorker {
    config: SimConfig,
    shared: Arc<RwLock<RenderState>>,
    state: RenderState,
    arrays: Vec<Option<SpeakerArray>>,
    /// Low pass state of the sub crossover, per receiver and source
    crossover: Vec<Vec<f64>>,
    room_eq: Vec<MultibandPeq>,
    rng: StdRng,
    /// Samples rendered so far
    time: usize,
}

impl RenderWorker {
    fn new(config: SimConfig, shared: Arc<RwLock<RenderState>>) -> Self {
        let rng = StdRng::seed_from_u64(config.seed.wrapping_mul(31).wrapping_add(7));
        Self {
            config,
            shared,
            state: RenderState::default(),
            arrays: Vec::new(),
            crossover: Vec::new(),
            room_eq: Vec::new(),
            rng,
            time: 0,
        }
    }

    fn run(&mut self, rx: mpsc::Receiver<Signal>) {
        let block_duration = Duration::from_secs_f64(self.config.block_size as f64 / self.config.sample_rate);
        let mut pending: Option<PendingCapture> = None;
        let mut deadline = Instant::now();

        loop {
            let signal = if pending.is_none() && !self.config.realtime {
                match rx.recv() {
                    Ok(signal) => Some(signal),
                    Err(_) => break,
                }
            } else {
                match rx.try_recv() {
                    Ok(signal) => Some(signal),
                    Err(mpsc::TryRecvError::Empty) => None,
                    Err(mpsc::TryRecvError::Disconnected) => break,
                }
            };
            match signal {
                Some(Signal::Stop) => break,
                Some(Signal::Capture(request)) => {
                    if let Some(previous) = pending.take() {
                        let _ = previous.reply.send(Err(EngineError::CaptureFailed(
                            "superseded by a new capture".to_string(),
                        )));
                    }
                    pending = Some(PendingCapture {
                        buffers: vec![Vec::with_capacity(request.samples); request.ports.len()],
                        ports: request.ports,
                        samples: request.samples,
                        reply: request.reply,
                    });
                }
                None => {}
            }

            self.refresh();
            let block = self.render_block(self.config.block_size);

            let complete = pending
                .as_mut()
                .is_some_and(|capture| capture.append(&block, self.config.block_size));
            if complete {
                if let Some(done) = pending.take() {
                    let _ = done.reply.send(Ok(done.buffers));
                }
            }

            if self.config.realtime {
                deadline += block_duration;
                let now = Instant::now();
                if deadline > now {
                    spin_sleep::sleep(deadline - now);
                } else if now - deadline > block_duration * 8 {
                    // fell far behind, do not try to catch up
                    deadline = now;
                }
            }
        }
        debug!("render thread stopped");
    }

    /// Picks up new shared state without ever waiting for a lock.
    fn refresh(&mut self) {
        let current = &self.state;
        let update = self.shared.try_read().and_then(|shared| {
            let changed = shared.generation != current.generation
                || !Arc::ptr_eq(&shared.scene, &current.scene);
            changed.then(|| shared.clone())
        });
        if let Some(state) = update {
            let new_scene = !Arc::ptr_eq(&state.scene, &self.state.scene);
            self.state = state;
            if new_scene {
                self.reset_scene();
            }
        }

        let scene = Arc::clone(&self.state.scene);
        for (r, receiver) in scene.receivers.iter().enumerate() {
            if let ReceiverKind::Speakers(handle) = &receiver.kind {
                let current = self.arrays[r].as_ref().map(|a| a.generation);
                match handle.try_read() {
                    Some(array) if Some(array.generation) != current => {
                        self.arrays[r] = Some(array.clone());
                    }
                    Some(_) => {}
                    None => warn!(
                        "receiver '{}' is being updated, rendering with previous speaker state",
                        receiver.name
                    ),
                }
            }
        }
    }

    fn reset_scene(&mut self) {
        let scene = &self.state.scene;
        self.arrays = vec![None; scene.receivers.len()];
        self.crossover = vec![vec![0.0; scene.sources.len()]; scene.receivers.len()];
        self.room_eq = scene
            .room
            .resonance
            .iter()
            .map(|stage| MultibandPeq::from_stages(vec![*stage], self.config.sample_rate))
            .collect();
    }

    fn render_block(&mut self, n: usize) -> Block {
        let scene = Arc::clone(&self.state.scene);
        let room = &scene.room;
        let physical = room.speakers + room.subs;
        let mut feeds = vec![vec![0.0_f32; n]; physical];
        let mut block = Block {
            receivers: Vec::with_capacity(scene.receivers.len()),
            ..Default::default()
        };
        let alpha = 1.0 - (-2.0 * PI * SUB_CROSSOVER / self.config.sample_rate).exp();
        let t0 = self.time;

        for (r, receiver) in scene.receivers.iter().enumerate() {
            let muted = self.state.receiver_muted.get(r).copied().unwrap_or(true);
            let outputs = match &receiver.kind {
                ReceiverKind::Omni => {
                    let mut out = vec![0.0_f32; n];
                    if !muted {
                        self.mix_dry(&scene, t0, &mut out);
                    }
                    vec![out]
                }
                ReceiverKind::Speakers(_) => match self.arrays.get_mut(r) {
                Some(Some(array)) => {
                    let channels = array.speakers.len() + array.subs.len();
                    let mut out = vec![vec![0.0_f32; n]; channels];
                    if !muted {
                        render_speakers(
                            &self.state,
                            &scene,
                            array,
                            &mut self.crossover[r],
                            r,
                            alpha,
                            t0,
                            &mut out,
                        );
                        for (ch, channel) in out.iter().enumerate() {
                            let k = if ch < array.speakers.len() {
                                Some(ch).filter(|&k| k < room.speakers)
                            } else {
                                Some(room.speakers + ch - array.speakers.len())
                                    .filter(|&k| k < physical)
                            };
                            if let Some(k) = k {
                                for (f, x) in feeds[k].iter_mut().zip(channel) {
                                    *f += x;
                                }
                            }
                        }
                    }
                    out
                }
                _ => Vec::new(),
                },
            };
            block.receivers.push(outputs);
        }

        block.routes = scene
            .routes
            .iter()
            .map(|route| cyclic(&route.stimulus, t0, n))
            .collect();

        let system_pa = P_REF * 10.0_f64.powf(self.config.system_level_db / 20.0);
        for (k, feed) in feeds.iter_mut().enumerate() {
            if let Some(eq) = self.room_eq.get_mut(k) {
                eq.process(feed);
            }
        }
        let noise_amplitude = P_REF * 10.0_f64.powf(self.config.noise_level_db / 20.0) * 3.0_f64.sqrt();
        block.mics = (0..self.config.mics)
            .map(|m| {
                let mut mic: Vec<f32> = (0..n)
                    .map(|_| (noise_amplitude * self.rng.gen_range(-1.0..1.0)) as f32)
                    .collect();
                for (k, feed) in feeds.iter().enumerate() {
                    let offset = room.sensitivity_db[k] + room.mic_db[m][k];
                    let gain = (system_pa * 10.0_f64.powf(offset / 20.0)) as f32;
                    for (p, x) in mic.iter_mut().zip(feed) {
                        *p += gain * x;
                    }
                }
                mic
            })
            .collect();

        self.time = self.time.wrapping_add(n);
        block
    }

    /// Pressure of all unmuted sources and diffuse fields at the centre.
    fn mix_dry(&self, scene: &SceneData, t0: usize, out: &mut [f32]) {
        let n = out.len();
        let active = scene
            .sources
            .iter()
            .zip(&self.state.source_muted)
            .chain(scene.diffuse.iter().zip(&self.state.diffuse_muted))
            .filter(|(_, muted)| !**muted);
        for (stimulus, _) in active {
            for (o, x) in out.iter_mut().zip(cyclic(stimulus, t0, n)) {
                *o += x;
            }
        }
    }
}

/// Renders the sources and diffuse fields of a scene to the channels of one
/// speaker based receiver, in full scale units.
#[allow(clippy::too_many_arguments)]
fn render_speakers(
    state: &RenderState,
    scene: &SceneData,
    array: &mut SpeakerArray,
    crossover: &mut [f64],
    receiver: usize,
    alpha: f64,
    t0: usize,
    out: &mut [Vec<f32>],
) {
    let n = out.first().map(Vec::len).unwrap_or(0);
    let n_spk = array.speakers.len();
    if n_spk + array.subs.len() == 0 {
        return;
    }
    let nearest = |entries: &[crate::layout::SpeakerEntry], dir: &Direction| {
        entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.direction.dot(dir).total_cmp(&b.direction.dot(dir)))
            .map(|(k, _)| k)
    };

    for (i, stimulus) in scene.sources.iter().enumerate() {
        if state.source_muted.get(i).copied().unwrap_or(true) {
            continue;
        }
        let direction = state.source_position.get(i).copied().unwrap_or(Direction::FRONT);
        let signal = cyclic(stimulus, t0, n);
        let speaker = nearest(&array.speakers, &direction);
        let sub = nearest(&array.subs, &direction).map(|k| n_spk + k);

        match (speaker, sub) {
            (Some(k), Some(s)) => {
                let mut lp = crossover[i];
                for (j, &x) in signal.iter().enumerate() {
                    lp += alpha * (x as f64 - lp);
                    out[s][j] += lp as f32;
                    out[k][j] += (x as f64 - lp) as f32;
                }
                crossover[i] = lp;
            }
            (Some(k), None) | (None, Some(k)) => {
                for (o, x) in out[k].iter_mut().zip(&signal) {
                    *o += x;
                }
            }
            (None, None) => {}
        }
    }

    if n_spk > 0 {
        let diffuse_gain = state.diffusegain.get(receiver).copied().unwrap_or(1.0) / (n_spk as f64).sqrt();
        for (d, stimulus) in scene.diffuse.iter().enumerate() {
            if state.diffuse_muted.get(d).copied().unwrap_or(true) {
                continue;
            }
            // decorrelate the speakers by reading the period at different offsets
            let stride = stimulus.len() / n_spk;
            for (k, channel) in out.iter_mut().take(n_spk).enumerate() {
                let signal = cyclic(stimulus, t0 + k * stride, n);
                for (o, x) in channel.iter_mut().zip(signal) {
                    *o += (diffuse_gain as f32) * x;
                }
            }
        }
    }

    let full_scale = 1.0 / state.caliblevel.get(receiver).copied().unwrap_or(1.0);
    for (entry, channel) in array.entries_mut().zip(out.iter_mut()) {
        if entry.eq_active() {
            entry.eq.process(channel);
        }
        let gain = (entry.gain * full_scale) as f32;
        for x in channel.iter_mut() {
            *x *= gain;
        }
    }
}

/// `n` samples of a periodic signal starting at sample `t0`.
fn cyclic(period: &[f32], t0: usize, n: usize) -> Vec<f32> {
    if period.is_empty() {
        return vec![0.0; n];
    }
    let len = period.len();
    (0..n).map(|j| period[(t0 + j) % len]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{ReceiverSpec, SourceSpec, StimulusSpec},
        spectrum::{level_db, PowerSpectrum},
    };
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn unreadable_receiver_captures_silence() {
        let (reply, _rx) = mpsc::channel();
        let mut capture = PendingCapture {
            ports: vec![PortRef::Mic(0), PortRef::Receiver(0, 1), PortRef::Route(3, 0)],
            buffers: vec![Vec::new(); 3],
            samples: 6,
            reply,
        };
        let block = Block {
            mics: vec![vec![0.5; 4]],
            receivers: vec![Vec::new()],
            routes: Vec::new(),
        };
        assert!(block.port(PortRef::Receiver(0, 1)).is_none());
        assert!(block.port(PortRef::Receiver(2, 0)).is_none());

        assert!(!capture.append(&block, 4));
        assert!(capture.append(&block, 4));
        assert_eq!(capture.buffers[0], vec![0.5; 6]);
        assert_eq!(capture.buffers[1], vec![0.0; 6]);
        assert_eq!(capture.buffers[2], vec![0.0; 6]);
    }

    fn stimulus() -> StimulusSpec {
        StimulusSpec {
            level: 70.0,
            period: 0.25,
            fmin: 250.0,
            fmax: 2000.0,
        }
    }

    fn layout() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"<layout><speaker az="0"/><speaker az="90"/><speaker az="180"/><speaker az="270"/></layout>"#
        )
        .unwrap();
        file.flush().unwrap();
        file
    }

    fn scene(layout: &NamedTempFile) -> SceneSpec {
        SceneSpec {
            name: "test".to_string(),
            sources: vec![SourceSpec {
                name: "src".to_string(),
                muted: false,
                stimulus: stimulus(),
            }],
            diffuse: vec![],
            receivers: vec![
                ReceiverSpec {
                    name: "nsp".to_string(),
                    attrs: vec![("type".to_string(), "nsp".to_string())],
                    layout: Some(layout.path().to_path_buf()),
                    muted: false,
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

    fn quiet_engine() -> SimEngine {
        SimEngine::new(SimConfig {
            sensitivity_spread_db: 0.0,
            resonance_db: 0.0,
            noise_level_db: -50.0,
            ..Default::default()
        })
    }

    fn capture(engine: &SimEngine, ports: &[&str], samples: usize) -> Vec<Vec<f32>> {
        let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
        let mut buffers = vec![vec![0.0; samples]; ports.len()];
        engine.record(&ports, &mut buffers).unwrap();
        buffers
    }

    fn level(signal: &[f32]) -> f64 {
        level_db(PowerSpectrum::new(signal, 48000.0).mean_square())
    }

    #[test]
    fn resolves_receivers() {
        let file = layout();
        let mut engine = quiet_engine();
        engine.load_scene(scene(&file)).unwrap();
        assert_eq!(engine.source_count(), 1);
        assert_eq!(engine.receiver_count(), 2);
        assert_eq!(engine.speaker_receiver(ReceiverId(0)).unwrap().read().speakers.len(), 4);
        assert!(matches!(
            engine.speaker_receiver(ReceiverId(1)),
            Err(EngineError::NotSpeakerCapable(name)) if name == "ref"
        ));
        assert!(matches!(
            engine.speaker_receiver(ReceiverId(2)),
            Err(EngineError::UnknownObject(_))
        ));
    }

    #[test]
    fn rejects_unknown_ports() {
        let file = layout();
        let mut engine = quiet_engine();
        engine.load_scene(scene(&file)).unwrap();
        for port in ["system:capture_0", "system:capture_5", "render.other:ref.0", "render.test:nsp.4"] {
            let mut buffers = vec![vec![0.0; 16]];
            assert!(matches!(
                engine.record(&[port.to_string()], &mut buffers),
                Err(EngineError::UnknownPort(_))
            ));
        }
    }

    #[test]
    fn reference_port_carries_the_dry_stimulus() {
        let file = layout();
        let mut engine = quiet_engine();
        engine.load_scene(scene(&file)).unwrap();
        let buffers = capture(&engine, &["render.test:ref.0", "system:capture_1"], 12000);
        assert!((level(&buffers[0]) - 70.0).abs() < 0.01);
        // a flat room at the default calibration level reproduces the stimulus
        assert!((level(&buffers[1]) - 70.0).abs() < 1.0);
    }

    #[test]
    fn source_plays_on_the_nearest_speaker() {
        let file = layout();
        let mut engine = quiet_engine();
        engine.load_scene(scene(&file)).unwrap();
        engine
            .set_source_position(SourceId(0), Direction::from_degrees(80.0, 0.0))
            .unwrap();
        let buffers = capture(&engine, &["render.test:nsp.0", "render.test:nsp.1"], 4800);
        assert!(buffers[0].iter().all(|&x| x == 0.0));
        assert!(buffers[1].iter().any(|&x| x != 0.0));
    }

    #[test]
    fn gains_and_mutes_reach_the_render_thread() {
        let file = layout();
        let mut engine = quiet_engine();
        engine.load_scene(scene(&file)).unwrap();
        let handle = engine.speaker_receiver(ReceiverId(0)).unwrap();
        handle.update(|array| array.speakers[0].gain = 0.5);
        let buffers = capture(&engine, &["system:capture_1"], 12000);
        assert!((level(&buffers[0]) - (70.0 - 6.02)).abs() < 1.0);

        engine.set_mute(ObjectRef::Source(SourceId(0)), true).unwrap();
        let buffers = capture(&engine, &["system:capture_1"], 12000);
        assert!(level(&buffers[0]) < 0.0);
        assert!(engine.set_mute(ObjectRef::Source(SourceId(3)), true).is_err());
    }

    #[test]
    fn realtime_capture_takes_its_duration() {
        let file = layout();
        let mut engine = SimEngine::new(SimConfig {
            realtime: true,
            ..Default::default()
        });
        engine.load_scene(scene(&file)).unwrap();
        let start = Instant::now();
        capture(&engine, &["system:capture_1"], 4800);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn speaker_type_needs_a_layout() {
        let mut engine = quiet_engine();
        let mut spec = scene(&layout());
        spec.receivers[0].layout = None;
        assert!(matches!(engine.load_scene(spec), Err(EngineError::SceneRejected(_))));
    }
}
