//! Measurement parameters for one speaker group, with factory defaults,
//! site defaults from a RON file, and a copy stored inside the layout.
//!
//! A site defaults file overrides any subset of the factory values, for the
//! broadband speakers and the subwoofers separately:
//!
//! ```text
//! (
//!     speaker: (fmax: 8000.0, maxeqstages: 4),
//!     sub: (duration: 2.0),
//! )
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use xmltree::{Element, XMLNode};

use crate::{
    error::CalibError,
    layout::{attr_f64, read_document},
};

/// Element holding the broadband parameters in a layout file.
pub const SPEAKER_CONFIG_ELEMENT: &str = "speakercalibconfig";
/// Element holding the subwoofer parameters in a layout file.
pub const SUB_CONFIG_ELEMENT: &str = "subcalibconfig";

/// Parameters of measuring one speaker group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibParams {
    /// Whether these are the subwoofer parameters
    pub is_sub: bool,
    /// Lower frequency limit in Hz
    pub fmin: f64,
    /// Upper frequency limit in Hz
    pub fmax: f64,
    /// Stimulus period and capture length in seconds
    pub duration: f64,
    /// Settling time between moving the stimulus and capturing, in seconds
    pub prewait: f64,
    /// Stimulus level in dB SPL
    pub reflevel: f64,
    /// Number of analysis bands per octave
    pub bandsperoctave: f64,
    /// Overlap of neighbouring bands, in bands
    pub bandoverlap: f64,
    /// Upper bound of correction stages, 0 disables frequency correction
    pub maxeqstages: usize,
}

/// Optional per-field overrides, as found in a site defaults file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamOverrides {
    /// Replaces `fmin`
    pub fmin: Option<f64>,
    /// Replaces `fmax`
    pub fmax: Option<f64>,
    /// Replaces `duration`
    pub duration: Option<f64>,
    /// Replaces `prewait`
    pub prewait: Option<f64>,
    /// Replaces `reflevel`
    pub reflevel: Option<f64>,
    /// Replaces `bandsperoctave`
    pub bandsperoctave: Option<f64>,
    /// Replaces `bandoverlap`
    pub bandoverlap: Option<f64>,
    /// Replaces `maxeqstages`
    pub maxeqstages: Option<usize>,
}

/// Contents of a site defaults file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteDefaults {
    /// Overrides of the broadband parameters
    pub speaker: ParamOverrides,
    /// Overrides of the subwoofer parameters
    pub sub: ParamOverrides,
}

impl SiteDefaults {
    /// Reads a RON site defaults file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CalibError> {
        let text = fs::read_to_string(path)?;
        Ok(ron::from_str(&text)?)
    }
}

impl CalibParams {
    /// Factory defaults of the broadband or the subwoofer group.
    pub fn new(is_sub: bool) -> Self {
        let mut params = Self {
            is_sub,
            fmin: 0.0,
            fmax: 0.0,
            duration: 0.0,
            prewait: 0.0,
            reflevel: 0.0,
            bandsperoctave: 0.0,
            bandoverlap: 0.0,
            maxeqstages: 0,
        };
        params.factory_reset();
        params
    }

    /// Sets every value back to its factory default.
    pub fn factory_reset(&mut self) {
        if self.is_sub {
            self.fmin = 31.25;
            self.fmax = 62.5;
            self.duration = 4.0;
        } else {
            self.fmin = 62.5;
            self.fmax = 4000.0;
            self.duration = 1.0;
        }
        self.prewait = 0.125;
        self.reflevel = 70.0;
        self.bandsperoctave = 3.0;
        self.bandoverlap = 2.0;
        self.maxeqstages = 0;
    }

    /// Factory defaults, then the overrides of `defaults` that belong to
    /// this speaker group.
    pub fn apply_defaults(&mut self, defaults: &SiteDefaults) {
        self.factory_reset();
        let o = if self.is_sub {
            &defaults.sub
        } else {
            &defaults.speaker
        };
        self.fmin = o.fmin.unwrap_or(self.fmin);
        self.fmax = o.fmax.unwrap_or(self.fmax);
        self.duration = o.duration.unwrap_or(self.duration);
        self.prewait = o.prewait.unwrap_or(self.prewait);
        self.reflevel = o.reflevel.unwrap_or(self.reflevel);
        self.bandsperoctave = o.bandsperoctave.unwrap_or(self.bandsperoctave);
        self.bandoverlap = o.bandoverlap.unwrap_or(self.bandoverlap);
        self.maxeqstages = o.maxeqstages.unwrap_or(self.maxeqstages);
    }

    /// Resets to factory values, then applies a site defaults file.
    pub fn read_defaults(&mut self, path: impl AsRef<Path>) -> Result<(), CalibError> {
        let defaults = SiteDefaults::from_path(path)?;
        self.apply_defaults(&defaults);
        Ok(())
    }

    fn element_name(&self) -> &'static str {
        if self.is_sub {
            SUB_CONFIG_ELEMENT
        } else {
            SPEAKER_CONFIG_ELEMENT
        }
    }

    /// Reads the attributes present in this group's config element of a
    /// layout root, adding an empty element if there is none.
    pub fn read_xml(&mut self, root: &mut Element) -> Result<(), CalibError> {
        let elem = find_or_add_child(root, self.element_name());
        self.fmin = attr_f64(elem, "fmin", self.fmin)?;
        self.fmax = attr_f64(elem, "fmax", self.fmax)?;
        self.duration = attr_f64(elem, "duration", self.duration)?;
        self.prewait = attr_f64(elem, "prewait", self.prewait)?;
        self.reflevel = attr_f64(elem, "reflevel", self.reflevel)?;
        self.bandsperoctave = attr_f64(elem, "bandsperoctave", self.bandsperoctave)?;
        self.bandoverlap = attr_f64(elem, "bandoverlap", self.bandoverlap)?;
        let stages = attr_f64(elem, "maxeqstages", self.maxeqstages as f64)?;
        if stages < 0.0 || stages.fract() != 0.0 {
            return Err(CalibError::Layout(format!(
                "attribute 'maxeqstages' of <{}> must be a non-negative integer",
                elem.name
            )));
        }
        self.maxeqstages = stages as usize;
        Ok(())
    }

    /// Writes every parameter into this group's config element.
    pub fn save_xml(&self, root: &mut Element) {
        let elem = find_or_add_child(root, self.element_name());
        for (name, value) in [
            ("fmin", self.fmin),
            ("fmax", self.fmax),
            ("duration", self.duration),
            ("prewait", self.prewait),
            ("reflevel", self.reflevel),
            ("bandsperoctave", self.bandsperoctave),
            ("bandoverlap", self.bandoverlap),
        ] {
            elem.attributes.insert(name.to_string(), value.to_string());
        }
        elem.attributes
            .insert("maxeqstages".to_string(), self.maxeqstages.to_string());
    }

    /// Checks that the parameters describe a measurable band plan and capture.
    pub fn validate(&self) -> Result<(), CalibError> {
        let group = if self.is_sub { "sub" } else { "speaker" };
        let fail = |msg: String| Err(CalibError::InvalidParameters(format!("{}: {}", group, msg)));
        let values = [
            ("fmin", self.fmin),
            ("fmax", self.fmax),
            ("duration", self.duration),
            ("prewait", self.prewait),
            ("reflevel", self.reflevel),
            ("bandsperoctave", self.bandsperoctave),
            ("bandoverlap", self.bandoverlap),
        ];
        if let Some((name, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return fail(format!("{} must be finite, got {}", name, value));
        }
        if !(self.fmin > 0.0) {
            return fail(format!("fmin must be positive, got {}", self.fmin));
        }
        if !(self.fmin < self.fmax) {
            return fail(format!(
                "fmin ({}) must be below fmax ({})",
                self.fmin, self.fmax
            ));
        }
        if !(self.duration > 0.0) {
            return fail(format!("duration must be positive, got {}", self.duration));
        }
        if !(self.prewait > 0.0) {
            return fail(format!("prewait must be positive, got {}", self.prewait));
        }
        if !(self.bandsperoctave > 0.0) {
            return fail(format!(
                "bandsperoctave must be positive, got {}",
                self.bandsperoctave
            ));
        }
        if !(self.bandoverlap >= 0.0) {
            return fail(format!(
                "bandoverlap must not be negative, got {}",
                self.bandoverlap
            ));
        }
        Ok(())
    }
}

/// The broadband and subwoofer parameters for calibrating `layout`: factory
/// values, overridden by the site defaults file if there is one, overridden
/// by the configuration stored in the layout itself.
pub fn load_params(
    layout: &Path,
    site_defaults: Option<&Path>,
) -> Result<(CalibParams, CalibParams), CalibError> {
    let defaults = match site_defaults {
        Some(path) => SiteDefaults::from_path(path)?,
        None => SiteDefaults::default(),
    };
    let mut root = read_document(layout)?;
    let mut speaker = CalibParams::new(false);
    let mut sub = CalibParams::new(true);
    for params in [&mut speaker, &mut sub] {
        params.apply_defaults(&defaults);
        params.read_xml(&mut root)?;
    }
    Ok((speaker, sub))
}

fn find_or_add_child<'a>(root: &'a mut Element, name: &str) -> &'a mut Element {
    let position = root
        .children
        .iter()
        .position(|node| matches!(node, XMLNode::Element(e) if e.name == name));
    let index = match position {
        Some(index) => index,
        None => {
            root.children.push(XMLNode::Element(Element::new(name)));
            root.children.len() - 1
        }
    };
    match &mut root.children[index] {
        XMLNode::Element(e) => e,
        _ => unreachable!("index points at an element"),
    }
}
