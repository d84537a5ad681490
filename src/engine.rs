//! The interface between the calibration pipeline and the audio rendering
//! engine that plays the stimuli and captures the microphones.
//!
//! The engine owns a real-time thread that reads the speaker gains and
//! filters while the control thread of a calibration run changes them. That
//! state is shared through [SpeakerReceiver], a handle around a
//! reader/writer lock: control code writes through [SpeakerReceiver::update],
//! the render thread only ever attempts a non-blocking read.

use std::{fmt, path::PathBuf, sync::Arc};

use parking_lot::{RwLock, RwLockReadGuard};

use crate::layout::{Direction, SpeakerArray};

/// Index of a point source in the loaded scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub usize);

/// Index of a receiver in the loaded scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(pub usize);

/// Index of a diffuse sound field in the loaded scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiffuseId(pub usize);

/// Anything in a scene that can be muted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    /// A point source
    Source(SourceId),
    /// A diffuse sound field
    Diffuse(DiffuseId),
    /// A receiver
    Receiver(ReceiverId),
}

/// Band limited pink noise, repeated with a fixed period.
#[derive(Debug, Clone, PartialEq)]
pub struct StimulusSpec {
    /// RMS level in dB SPL
    pub level: f64,
    /// Period in seconds
    pub period: f64,
    /// Lower band edge in Hz
    pub fmin: f64,
    /// Upper band edge in Hz
    pub fmax: f64,
}

/// A point source playing a stimulus.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    /// Name in the scene
    pub name: String,
    /// Whether the source starts muted
    pub muted: bool,
    /// Signal the source plays
    pub stimulus: StimulusSpec,
}

/// A diffuse field playing a stimulus.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffuseSpec {
    /// Name in the scene
    pub name: String,
    /// Whether the diffuse field starts muted
    pub muted: bool,
    /// Signal the diffuse field plays
    pub stimulus: StimulusSpec,
}

/// A receiver, i.e. one rendering method driving a set of output channels.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverSpec {
    /// Name in the scene
    pub name: String,
    /// Receiver attributes such as `type`, e.g. `("type", "nsp")`
    pub attrs: Vec<(String, String)>,
    /// Speaker layout the receiver renders to, when it is speaker based
    pub layout: Option<PathBuf>,
    /// Whether the receiver starts muted
    pub muted: bool,
}

impl ReceiverSpec {
    /// The value of the `type` attribute, if any.
    pub fn receiver_type(&self) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(name, _)| name == "type")
            .map(|(_, value)| value.as_str())
    }
}

/// An auxiliary route that plays a stimulus straight to its own ports,
/// used for monitoring.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    /// Name of the route, also the prefix of its ports
    pub name: String,
    /// Number of output channels
    pub channels: usize,
    /// Signal played on every channel
    pub stimulus: StimulusSpec,
}

/// An in-memory scene description.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SceneSpec {
    /// Name of the scene, used in the port names of its receivers
    pub name: String,
    /// Point sources, broadband first
    pub sources: Vec<SourceSpec>,
    /// Diffuse sound fields
    pub diffuse: Vec<DiffuseSpec>,
    /// Receivers, in render order
    pub receivers: Vec<ReceiverSpec>,
}

/// Failures reported by a [RenderEngine].
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A port name that the engine does not know
    UnknownPort(String),
    /// An object reference that is not part of the loaded scene
    UnknownObject(String),
    /// The receiver exists but does not render to a speaker array
    NotSpeakerCapable(String),
    /// The scene description could not be loaded
    SceneRejected(String),
    /// The capture could not be completed
    CaptureFailed(String),
    /// The render thread did not deliver the capture in time
    CaptureTimeout,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::UnknownPort(port) => write!(f, "unknown port '{}'", port),
            EngineError::UnknownObject(what) => write!(f, "unknown scene object {}", what),
            EngineError::NotSpeakerCapable(name) => {
                write!(f, "receiver '{}' is not speaker based", name)
            }
            EngineError::SceneRejected(msg) => write!(f, "scene rejected: {}", msg),
            EngineError::CaptureFailed(msg) => write!(f, "capture failed: {}", msg),
            EngineError::CaptureTimeout => write!(f, "capture timed out"),
        }
    }
}

impl std::error::Error for EngineError {}

/// A capability typed handle on the speaker array of a speaker based
/// receiver. Clones share the same array.
#[derive(Debug, Clone)]
pub struct SpeakerReceiver {
    name: String,
    array: Arc<RwLock<SpeakerArray>>,
}

impl SpeakerReceiver {
    /// Wraps a speaker array so that it can be shared with a render thread.
    pub fn new(name: impl Into<String>, array: SpeakerArray) -> Self {
        Self {
            name: name.into(),
            array: Arc::new(RwLock::new(array)),
        }
    }

    /// Name of the receiver this handle belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocking shared access, for the control thread.
    pub fn read(&self) -> RwLockReadGuard<'_, SpeakerArray> {
        self.array.read()
    }

    /// Non-blocking shared access, for the render thread. Returns None while
    /// the control thread holds the write lock.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, SpeakerArray>> {
        self.array.try_read()
    }

    /// Mutates the array under the exclusive lock and bumps its generation,
    /// so that readers holding a copy know to refresh it.
    pub fn update<R>(&self, f: impl FnOnce(&mut SpeakerArray) -> R) -> R {
        let mut array = self.array.write();
        let result = f(&mut array);
        array.generation = array.generation.wrapping_add(1);
        result
    }

    /// Whether two handles refer to the same array.
    pub fn same_array(&self, other: &SpeakerReceiver) -> bool {
        Arc::ptr_eq(&self.array, &other.array)
    }
}

/// The operations the calibration pipeline needs from a rendering engine.
///
/// Control methods take `&self`; implementations keep their shared state
/// behind their own locks so that a render thread can run concurrently.
pub trait RenderEngine {
    /// Sample rate of the engine in Hz.
    fn sample_rate(&self) -> f64;

    /// Replaces the current scene.
    fn load_scene(&mut self, scene: SceneSpec) -> Result<(), EngineError>;

    /// Adds an auxiliary route next to the scene.
    fn add_module(&mut self, route: RouteSpec) -> Result<(), EngineError>;

    /// Number of point sources in the loaded scene.
    fn source_count(&self) -> usize;

    /// Number of receivers in the loaded scene.
    fn receiver_count(&self) -> usize;

    /// Resolves a receiver to its speaker array, failing with
    /// [EngineError::NotSpeakerCapable] for receivers without one.
    fn speaker_receiver(&self, id: ReceiverId) -> Result<SpeakerReceiver, EngineError>;

    fn set_mute(&self, object: ObjectRef, muted: bool) -> Result<(), EngineError>;

    /// Moves a point source to a direction relative to the array centre.
    fn set_source_position(&self, id: SourceId, direction: Direction) -> Result<(), EngineError>;

    /// Calibration level of a receiver, in Pascal.
    fn caliblevel(&self, id: ReceiverId) -> Result<f64, EngineError>;

    fn set_caliblevel(&self, id: ReceiverId, pascal: f64) -> Result<(), EngineError>;

    /// Linear gain of the diffuse sound field rendered by a receiver.
    fn diffusegain(&self, id: ReceiverId) -> Result<f64, EngineError>;

    fn set_diffusegain(&self, id: ReceiverId, gain: f64) -> Result<(), EngineError>;

    /// Captures one buffer per port. Blocks until every buffer is completely
    /// filled; the number of samples is the length of each buffer.
    fn record(&self, ports: &[String], buffers: &mut [Vec<f32>]) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SpeakerEntry;

    #[test]
    fn updates_are_visible_through_every_clone() {
        let array = SpeakerArray::new(vec![SpeakerEntry::new(Direction::FRONT)], vec![]);
        let handle = SpeakerReceiver::new("nsp", array);
        let other = handle.clone();
        assert!(handle.same_array(&other));

        let generation = handle.read().generation;
        handle.update(|a| a.speakers[0].gain = 0.5);
        assert_eq!(other.read().speakers[0].gain, 0.5);
        assert_eq!(other.read().generation, generation + 1);
    }

    #[test]
    fn try_read_fails_while_writing() {
        let handle = SpeakerReceiver::new("nsp", SpeakerArray::default());
        let reader = handle.clone();
        handle.update(|_| assert!(reader.try_read().is_none()));
        assert!(reader.try_read().is_some());
    }

    #[test]
    fn receiver_type_attribute() {
        let spec = ReceiverSpec {
            name: "out2".to_string(),
            attrs: vec![
                ("order".to_string(), "3".to_string()),
                ("type".to_string(), "hoa2d".to_string()),
            ],
            layout: None,
            muted: true,
        };
        assert_eq!(spec.receiver_type(), Some("hoa2d"));
    }
}
