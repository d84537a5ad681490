//! The error type shared by every stage of a calibration run.

use std::{borrow::Cow, fmt};

use crate::{component::ComponentError, engine::EngineError};

/// Everything that can go wrong while measuring, fitting or persisting a
/// speaker calibration. Apart from [CalibError::Aborted], all of these end
/// the calibration run; nothing in this crate retries.
#[derive(Debug)]
pub enum CalibError {
    /// The `calibfor` tag of the layout is not a comma separated list of
    /// `name:value` pairs.
    InvalidCalibFor(String),

    /// The calibration scene does not have the expected sources and
    /// receivers after construction, or a receiver cannot drive speakers.
    Topology(String),

    /// Tried to save into a document whose root element is not a layout.
    InvalidLayoutType(String),

    /// Calibration parameters violate their invariants.
    InvalidParameters(String),

    /// A layout attribute could not be interpreted.
    Layout(String),

    /// The rendering engine reported a failure.
    Engine(EngineError),

    /// Returned when io fails when reading or writing files.
    Io(std::io::Error),

    /// Returned when a layout document is not well-formed XML.
    XmlParse(xmltree::ParseError),

    /// Returned when a layout document cannot be written out.
    XmlWrite(xmltree::Error),

    /// Returned when deserialization of a defaults file fails.
    Ron(ron::de::SpannedError),

    /// The directory for recorded captures cannot be used.
    Recording(ComponentError),

    /// The measurement was cancelled between two speakers.
    Aborted,
}

impl fmt::Display for CalibError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CalibError as CE;
        let msg = match self {
            CE::InvalidCalibFor(tag) => Cow::from(format!(
                "invalid format of 'calibfor' attribute '{}': expected comma separated list of name:value pairs",
                tag
            )),
            CE::Topology(msg) => Cow::from(format!("programming error: {}", msg)),
            CE::InvalidLayoutType(found) => Cow::from(format!(
                "invalid file type, expected root node type \"layout\", got \"{}\"",
                found
            )),
            CE::InvalidParameters(msg) => Cow::from(format!("invalid calibration parameters: {}", msg)),
            CE::Layout(msg) => Cow::from(format!("layout error: {}", msg)),
            CE::Engine(error) => Cow::from(format!("engine error: {}", error)),
            CE::Io(error) => Cow::from(format!("io error: {}", error)),
            CE::XmlParse(error) => Cow::from(format!("xml parse error: {}", error)),
            CE::XmlWrite(error) => Cow::from(format!("xml write error: {}", error)),
            CE::Ron(error) => Cow::from(format!("ron error: {}", error)),
            CE::Recording(error) => Cow::from(format!("recording error: {}", error)),
            CE::Aborted => Cow::from("measurement aborted"),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for CalibError {}

impl From<EngineError> for CalibError {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}

impl From<std::io::Error> for CalibError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<xmltree::ParseError> for CalibError {
    fn from(value: xmltree::ParseError) -> Self {
        Self::XmlParse(value)
    }
}

impl From<xmltree::Error> for CalibError {
    fn from(value: xmltree::Error) -> Self {
        Self::XmlWrite(value)
    }
}

impl From<ron::de::SpannedError> for CalibError {
    fn from(value: ron::de::SpannedError) -> Self {
        Self::Ron(value)
    }
}

impl From<ComponentError> for CalibError {
    fn from(value: ComponentError) -> Self {
        Self::Recording(value)
    }
}
