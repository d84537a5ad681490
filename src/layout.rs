//! Speaker layouts: the in-memory speaker array a receiver renders to, and
//! the reading side of the layout file it was loaded from.
//!
//! A layout file is an XML document with a `layout` root element that
//! carries the calibration metadata and holds one `speaker` element per
//! broadband speaker and one `sub` element per subwoofer:
//!
//! ```text
//! <layout caliblevel="93" diffusegain="0" calibfor="type:nsp" checksum="..">
//!   <speaker az="0" el="0" gain="-1.2" eqstages="2" eqfreq=".." eqgain=".."/>
//!   <sub az="45" gain="0"/>
//! </layout>
//! ```

use std::{fs::File, io::BufReader, path::Path};

use log::{debug, warn};
use xmltree::{Element, XMLNode};

use crate::{
    attr_decoder::decode_float_vec,
    error::CalibError,
    peq::MultibandPeq,
};

/// Name of the root element of a layout file.
pub const LAYOUT_ROOT: &str = "layout";
/// Element name of a broadband speaker.
pub const SPEAKER_ELEMENT: &str = "speaker";
/// Element name of a subwoofer.
pub const SUB_ELEMENT: &str = "sub";

/// Calibration level assumed for layouts that were never calibrated, in dB.
pub const DEFAULT_CALIBLEVEL_DB: f64 = 93.0;

/// A direction relative to the centre of the array, as a unit vector.
/// `x` points to the front, `y` to the left, `z` up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Direction {
    /// Front
    pub x: f64,
    /// Left
    pub y: f64,
    /// Up
    pub z: f64,
}

impl Direction {
    /// Straight ahead.
    pub const FRONT: Direction = Direction {
        x: 1.0,
        y: 0.0,
        z: 0.0,
    };

    /// Normalises a position to a direction; the origin maps to the front.
    pub fn from_cartesian(x: f64, y: f64, z: f64) -> Self {
        let norm = (x * x + y * y + z * z).sqrt();
        if norm < 1e-12 {
            return Self::FRONT;
        }
        Self {
            x: x / norm,
            y: y / norm,
            z: z / norm,
        }
    }

    /// Azimuth and elevation in degrees.
    pub fn from_degrees(azimuth: f64, elevation: f64) -> Self {
        let (az, el) = (azimuth.to_radians(), elevation.to_radians());
        Self {
            x: el.cos() * az.cos(),
            y: el.cos() * az.sin(),
            z: el.sin(),
        }
    }

    /// Cosine of the angle between two directions.
    pub fn dot(&self, other: &Direction) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Azimuth in degrees.
    pub fn azimuth(&self) -> f64 {
        self.y.atan2(self.x).to_degrees()
    }

    /// Elevation in degrees.
    pub fn elevation(&self) -> f64 {
        self.z.clamp(-1.0, 1.0).asin().to_degrees()
    }
}

/// One loudspeaker of an array.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerEntry {
    /// Free text label, empty if the layout has none
    pub label: String,
    /// Direction of the speaker from the listening position
    pub direction: Direction,
    /// Distance from the centre in metres
    pub distance: f64,
    /// Linear gain
    pub gain: f64,
    /// Number of correction stages, 0 disables the filter
    pub eq_stages: usize,
    /// Correction filter fitted to the stored curves
    pub eq: MultibandPeq,
    /// Frequencies of the measured correction curve
    pub eq_freq: Vec<f32>,
    /// Gains in dB of the measured correction curve
    pub eq_gain: Vec<f32>,
}

impl SpeakerEntry {
    /// A speaker without gain or frequency correction.
    pub fn new(direction: Direction) -> Self {
        Self {
            label: String::new(),
            direction,
            distance: 1.0,
            gain: 1.0,
            eq_stages: 0,
            eq: MultibandPeq::default(),
            eq_freq: Vec::new(),
            eq_gain: Vec::new(),
        }
    }

    /// Whether the correction filter takes part in rendering.
    pub fn eq_active(&self) -> bool {
        self.eq_stages > 0 && !self.eq.is_identity()
    }

    /// Fits and stores a correction filter, or clears the correction when
    /// `stages` is 0 or there is no curve.
    pub fn set_correction(&mut self, stages: usize, freq: Vec<f32>, gain: Vec<f32>, sample_rate: f64) {
        if stages == 0 || freq.is_empty() {
            self.clear_correction(sample_rate);
            return;
        }
        self.eq = MultibandPeq::fit(stages, &freq, &gain, sample_rate);
        self.eq_stages = stages;
        self.eq_freq = freq;
        self.eq_gain = gain;
    }

    /// Removes the correction filter and its curves.
    pub fn clear_correction(&mut self, sample_rate: f64) {
        self.eq_stages = 0;
        self.eq = MultibandPeq::identity(sample_rate);
        self.eq_freq.clear();
        self.eq_gain.clear();
    }
}

/// Which part of an array a speaker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerGroup {
    /// Full range speakers
    Broadband,
    /// Subwoofers
    Subwoofer,
}

/// The broadband speakers of a receiver plus its subwoofers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpeakerArray {
    /// Broadband speakers, in document order
    pub speakers: Vec<SpeakerEntry>,
    /// Subwoofers, in document order
    pub subs: Vec<SpeakerEntry>,
    /// Incremented on every locked update
    pub generation: u64,
}

impl SpeakerArray {
    /// An array of uncorrected speakers.
    pub fn new(speakers: Vec<SpeakerEntry>, subs: Vec<SpeakerEntry>) -> Self {
        Self {
            speakers,
            subs,
            generation: 0,
        }
    }

    /// The speakers of one group.
    pub fn group(&self, group: SpeakerGroup) -> &[SpeakerEntry] {
        match group {
            SpeakerGroup::Broadband => &self.speakers,
            SpeakerGroup::Subwoofer => &self.subs,
        }
    }

    /// The speakers of one group, for changing them.
    pub fn group_mut(&mut self, group: SpeakerGroup) -> &mut Vec<SpeakerEntry> {
        match group {
            SpeakerGroup::Broadband => &mut self.speakers,
            SpeakerGroup::Subwoofer => &mut self.subs,
        }
    }

    /// Every entry, broadband speakers first.
    pub fn entries(&self) -> impl Iterator<Item = &SpeakerEntry> {
        self.speakers.iter().chain(self.subs.iter())
    }

    /// Every entry, broadband speakers first.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut SpeakerEntry> {
        self.speakers.iter_mut().chain(self.subs.iter_mut())
    }
}

/// A layout file as loaded for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerLayout {
    /// Reference level in dB SPL
    pub caliblevel_db: f64,
    /// Gain of the diffuse sound field in dB
    pub diffusegain_db: f64,
    /// Receiver type the layout was calibrated for
    pub calibfor: Option<String>,
    /// Date of the last calibration
    pub calibdate: Option<String>,
    /// The stored checksum, if the file has one
    pub checksum: Option<u64>,
    /// The speakers
    pub array: SpeakerArray,
}

impl SpeakerLayout {
    /// Loads the layout at `path`, refitting stored correction filters at
    /// `sample_rate`.
    pub fn from_path(path: impl AsRef<Path>, sample_rate: f64) -> Result<Self, CalibError> {
        let root = read_document(path.as_ref())?;
        let layout = Self::from_element(&root, sample_rate)?;
        debug!(
            "loaded {} speakers and {} subs from {}",
            layout.array.speakers.len(),
            layout.array.subs.len(),
            path.as_ref().display()
        );
        Ok(layout)
    }

    /// Reads a layout from its parsed root element.
    pub fn from_element(root: &Element, sample_rate: f64) -> Result<Self, CalibError> {
        if root.name != LAYOUT_ROOT {
            return Err(CalibError::InvalidLayoutType(root.name.clone()));
        }

        let checksum = match root.attributes.get("checksum") {
            Some(value) if !value.trim().is_empty() => Some(value.trim().parse::<u64>().map_err(
                |_| CalibError::Layout(format!("invalid checksum '{}'", value)),
            )?),
            _ => None,
        };
        if let Some(stored) = checksum {
            let actual = layout_checksum(root);
            if stored != actual {
                warn!(
                    "layout checksum mismatch (stored {}, computed {}), the file was modified after calibration",
                    stored, actual
                );
            }
        }

        let mut speakers = Vec::new();
        let mut subs = Vec::new();
        for elem in speaker_elements(root) {
            let entry = read_speaker(elem, sample_rate)?;
            if elem.name == SUB_ELEMENT {
                subs.push(entry);
            } else {
                speakers.push(entry);
            }
        }

        Ok(Self {
            caliblevel_db: attr_f64(root, "caliblevel", DEFAULT_CALIBLEVEL_DB)?,
            diffusegain_db: attr_f64(root, "diffusegain", 0.0)?,
            calibfor: non_empty_attr(root, "calibfor"),
            calibdate: non_empty_attr(root, "calibdate"),
            checksum,
            array: SpeakerArray::new(speakers, subs),
        })
    }

    /// Whether the stored checksum matches the content of the file.
    pub fn verify(path: impl AsRef<Path>) -> Result<Option<bool>, CalibError> {
        let root = read_document(path.as_ref())?;
        Ok(root
            .attributes
            .get("checksum")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|stored| stored == layout_checksum(&root)))
    }
}

/// Parses the XML document at `path`.
pub fn read_document(path: &Path) -> Result<Element, CalibError> {
    let file = File::open(path)?;
    Ok(Element::parse(BufReader::new(file))?)
}

/// The `calibfor` attribute of the layout root, if present and non-empty.
pub fn read_calibfor(path: impl AsRef<Path>) -> Result<Option<String>, CalibError> {
    let root = read_document(path.as_ref())?;
    Ok(non_empty_attr(&root, "calibfor"))
}

/// The `speaker` and `sub` children of a layout root, in document order.
pub fn speaker_elements(root: &Element) -> impl Iterator<Item = &Element> {
    root.children.iter().filter_map(|node| match node {
        XMLNode::Element(e) if e.name == SPEAKER_ELEMENT || e.name == SUB_ELEMENT => Some(e),
        _ => None,
    })
}

/// Mutable version of [speaker_elements].
pub fn speaker_elements_mut(root: &mut Element) -> impl Iterator<Item = &mut Element> {
    root.children.iter_mut().filter_map(|node| match node {
        XMLNode::Element(e) if e.name == SPEAKER_ELEMENT || e.name == SUB_ELEMENT => Some(e),
        _ => None,
    })
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

struct Fnv1a(u64);

impl Fnv1a {
    fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
        // field separator, so that "ab"+"c" and "a"+"bc" differ
        self.0 ^= 0xff;
        self.0 = self.0.wrapping_mul(FNV_PRIME);
    }
}

/// 64 bit FNV-1a hash over the calibration content of a layout: the root
/// `caliblevel` and `diffusegain`, then every speaker and sub element in
/// document order with its attributes sorted by name.
pub fn layout_checksum(root: &Element) -> u64 {
    let mut hash = Fnv1a(FNV_OFFSET_BASIS);
    for key in ["caliblevel", "diffusegain"] {
        hash.feed(key.as_bytes());
        hash.feed(root.attributes.get(key).map(String::as_str).unwrap_or("").as_bytes());
    }
    for elem in speaker_elements(root) {
        hash.feed(elem.name.as_bytes());
        let mut attrs: Vec<(&String, &String)> = elem.attributes.iter().collect();
        attrs.sort();
        for (key, value) in attrs {
            hash.feed(key.as_bytes());
            hash.feed(value.as_bytes());
        }
    }
    hash.0
}

fn non_empty_attr(elem: &Element, name: &str) -> Option<String> {
    elem.attributes
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// A numeric attribute; missing or empty attributes give `default`.
pub(crate) fn attr_f64(elem: &Element, name: &str, default: f64) -> Result<f64, CalibError> {
    match non_empty_attr(elem, name) {
        Some(value) => value.parse::<f64>().map_err(|_| {
            CalibError::Layout(format!(
                "attribute '{}' of <{}> is not a number: '{}'",
                name, elem.name, value
            ))
        }),
        None => Ok(default),
    }
}

fn attr_vec(elem: &Element, name: &str) -> Result<Vec<f32>, CalibError> {
    let value = elem.attributes.get(name).map(String::as_str).unwrap_or("");
    decode_float_vec(value).map_err(|e| {
        CalibError::Layout(format!(
            "attribute '{}' of <{}> is not a list of numbers near '{}'",
            name, elem.name, e.input
        ))
    })
}

fn read_speaker(elem: &Element, sample_rate: f64) -> Result<SpeakerEntry, CalibError> {
    let has_cartesian = ["x", "y", "z"]
        .iter()
        .any(|k| non_empty_attr(elem, k).is_some());
    let (direction, distance) = if has_cartesian {
        let (x, y, z) = (
            attr_f64(elem, "x", 0.0)?,
            attr_f64(elem, "y", 0.0)?,
            attr_f64(elem, "z", 0.0)?,
        );
        (
            Direction::from_cartesian(x, y, z),
            (x * x + y * y + z * z).sqrt(),
        )
    } else {
        (
            Direction::from_degrees(attr_f64(elem, "az", 0.0)?, attr_f64(elem, "el", 0.0)?),
            attr_f64(elem, "r", 1.0)?,
        )
    };

    let mut entry = SpeakerEntry::new(direction);
    entry.distance = distance;
    entry.label = elem.attributes.get("label").cloned().unwrap_or_default();
    entry.gain = 10.0_f64.powf(attr_f64(elem, "gain", 0.0)? / 20.0);
    entry.eq = MultibandPeq::identity(sample_rate);

    let stages = attr_f64(elem, "eqstages", 0.0)?;
    if stages < 0.0 || stages.fract() != 0.0 {
        return Err(CalibError::Layout(format!(
            "attribute 'eqstages' of <{}> must be a non-negative integer",
            elem.name
        )));
    }
    let freq = attr_vec(elem, "eqfreq")?;
    let gain = attr_vec(elem, "eqgain")?;
    if freq.len() != gain.len() {
        return Err(CalibError::Layout(format!(
            "<{}> has {} eqfreq but {} eqgain values",
            elem.name,
            freq.len(),
            gain.len()
        )));
    }
    entry.set_correction(stages as usize, freq, gain, sample_rate);

    Ok(entry)
}
