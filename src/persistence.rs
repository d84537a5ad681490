//! Writes a finished calibration back into a layout file.
//!
//! The source document is parsed, the calibration attributes are replaced in
//! place and everything else (comments, unknown attributes and elements) is
//! written back unchanged. The new file is written next to the destination
//! and renamed over it, so an interrupted save never leaves a truncated
//! layout behind.

use std::{fs, path::Path};

use log::info;
use tempfile::NamedTempFile;
use xmltree::{Element, EmitterConfig};

use crate::{
    attr_decoder::encode_float_vec,
    error::CalibError,
    layout::{layout_checksum, read_document, speaker_elements_mut, SpeakerArray, LAYOUT_ROOT, SUB_ELEMENT},
    measurement::ResponseMeasurement,
    params::CalibParams,
    spectrum::P_REF,
};

/// Format of the `calibdate` attribute.
pub const CALIBDATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Gains below this are written as this, instead of minus infinity.
const MIN_GAIN_DB: f64 = -200.0;

/// Everything a save needs from a calibration session.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationSnapshot<'a> {
    /// Reference level in Pa
    pub caliblevel: f64,
    /// Linear gain of the diffuse field
    pub diffusegain: f64,
    /// Receiver type the calibration is for
    pub calibfor: &'a str,
    /// Speakers of the calibrated receiver
    pub array: &'a SpeakerArray,
    /// Curves of the broadband response pass
    pub broadband: &'a ResponseMeasurement,
    /// Curves of the subwoofer response pass
    pub sub: &'a ResponseMeasurement,
    /// Parameters of the broadband measurement
    pub speaker_params: &'a CalibParams,
    /// Parameters of the subwoofer measurement
    pub sub_params: &'a CalibParams,
}

/// Significant digits of the dB values written to a layout.
const DB_DIGITS: i32 = 10;

/// `x` rounded to `digits` significant digits, so that values read from a
/// layout are written back as they were.
fn round_significant(x: f64, digits: i32) -> f64 {
    if x == 0.0 || !x.is_finite() {
        return x;
    }
    let scale = 10f64.powi(digits - 1 - x.abs().log10().floor() as i32);
    (x * scale).round() / scale
}

fn to_db(linear: f64) -> f64 {
    round_significant(20.0 * linear.log10(), DB_DIGITS)
}

fn gain_db(gain: f64) -> f64 {
    if gain > 0.0 {
        to_db(gain).max(MIN_GAIN_DB)
    } else {
        MIN_GAIN_DB
    }
}

/// Applies `snapshot` to a parsed layout root.
pub fn apply_calibration(root: &mut Element, snapshot: &CalibrationSnapshot) -> Result<(), CalibError> {
    if root.name != LAYOUT_ROOT {
        return Err(CalibError::InvalidLayoutType(root.name.clone()));
    }

    let set = |elem: &mut Element, key: &str, value: String| {
        elem.attributes.insert(key.to_string(), value);
    };

    // caliblevel is stored in dB SPL re 2e-5 Pa
    set(root, "caliblevel", to_db(snapshot.caliblevel / P_REF).to_string());
    set(root, "diffusegain", to_db(snapshot.diffusegain).to_string());

    let mut counts = [0usize; 2];
    for elem in speaker_elements_mut(root) {
        let (entries, response, k) = if elem.name == SUB_ELEMENT {
            counts[1] += 1;
            (&snapshot.array.subs, snapshot.sub, counts[1] - 1)
        } else {
            counts[0] += 1;
            (&snapshot.array.speakers, snapshot.broadband, counts[0] - 1)
        };

        // extra elements inherit the gain of the last entry
        if let Some(entry) = entries.get(k.min(entries.len().saturating_sub(1))) {
            set(elem, "gain", gain_db(entry.gain).to_string());
        }
        set(elem, "eqstages", response.stages.to_string());
        match response.gains.get(k) {
            Some(gains) if response.stages > 0 => {
                set(elem, "eqfreq", encode_float_vec(&response.freqs));
                set(elem, "eqgain", encode_float_vec(gains));
            }
            _ => {
                set(elem, "eqfreq", String::new());
                set(elem, "eqgain", String::new());
            }
        }
    }

    let checksum = layout_checksum(root);
    set(root, "checksum", checksum.to_string());
    set(root, "calibdate", chrono::Local::now().format(CALIBDATE_FORMAT).to_string());
    set(root, "calibfor", snapshot.calibfor.to_string());
    snapshot.speaker_params.save_xml(root);
    snapshot.sub_params.save_xml(root);
    Ok(())
}

/// Reads the layout at `source`, applies `snapshot` and writes the result to
/// `dest`. `dest` is untouched if anything fails.
pub fn save_calibration(
    source: &Path,
    dest: &Path,
    snapshot: &CalibrationSnapshot,
) -> Result<(), CalibError> {
    let mut root = read_document(source)?;
    apply_calibration(&mut root, snapshot)?;

    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    root.write_with_config(&mut tmp, EmitterConfig::new().perform_indent(true))?;
    // the temporary file is private, the layout keeps the mode it had
    if let Ok(meta) = fs::metadata(dest).or_else(|_| fs::metadata(source)) {
        tmp.as_file().set_permissions(meta.permissions())?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;

    info!("saved calibration to {}", dest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{read_calibfor, Direction, SpeakerEntry, SpeakerLayout};
    use std::io::Write;

    const FS: f64 = 48000.0;

    const LAYOUT: &str = r#"<?xml version="1.0"?>
<layout name="studio" caliblevel="93" label="keep me">
  <!-- front pair -->
  <speaker az="30" el="0" label="L"/>
  <speaker az="-30" el="0" label="R"/>
  <speaker az="180" el="0" label="B"/>
  <sub az="0" el="0"/>
  <other foo="bar"/>
</layout>
"#;

    fn layout_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn array() -> SpeakerArray {
        let mut speakers: Vec<SpeakerEntry> = [30.0, -30.0]
            .iter()
            .map(|&az| SpeakerEntry::new(Direction::from_degrees(az, 0.0)))
            .collect();
        speakers[0].gain = 0.5;
        let subs = vec![SpeakerEntry::new(Direction::FRONT)];
        SpeakerArray::new(speakers, subs)
    }

    fn response() -> ResponseMeasurement {
        ResponseMeasurement {
            stages: 2,
            freqs: vec![125.0, 250.0, 500.0, 1000.0, 2000.0],
            gains: vec![
                vec![0.0, -1.5, -3.25, -0.5, -2.0],
                vec![-4.0, 0.0, -1.0, -1.0, -0.125],
            ],
        }
    }

    fn save(source: &Path, dest: &Path) -> Result<(), CalibError> {
        let array = array();
        let bb = response();
        let sub = ResponseMeasurement::default();
        let speaker_params = CalibParams::new(false);
        let sub_params = CalibParams::new(true);
        save_calibration(
            source,
            dest,
            &CalibrationSnapshot {
                caliblevel: 2e-5 * 10.0_f64.powf(94.0 / 20.0),
                diffusegain: 0.5,
                calibfor: "type:nsp",
                array: &array,
                broadband: &bb,
                sub: &sub,
                speaker_params: &speaker_params,
                sub_params: &sub_params,
            },
        )
    }

    #[test]
    fn saved_layout_loads_back() {
        let source = layout_file(LAYOUT);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("calibrated.spk");
        save(source.path(), &dest).unwrap();

        let layout = SpeakerLayout::from_path(&dest, FS).unwrap();
        assert!((layout.caliblevel_db - 94.0).abs() < 1e-9);
        assert!((layout.diffusegain_db - 20.0 * 0.5_f64.log10()).abs() < 1e-9);
        assert_eq!(layout.calibfor.as_deref(), Some("type:nsp"));
        assert!(layout.calibdate.is_some());
        assert_eq!(SpeakerLayout::verify(&dest).unwrap(), Some(true));

        let speakers = &layout.array.speakers;
        assert_eq!(speakers.len(), 3);
        assert!((speakers[0].gain - 0.5).abs() < 1e-9);
        assert!((speakers[1].gain - 1.0).abs() < 1e-9);
        // third speaker takes the last computed gain
        assert!((speakers[2].gain - 1.0).abs() < 1e-9);
        assert_eq!(speakers[0].eq_stages, 2);
        assert_eq!(speakers[0].eq_freq, response().freqs);
        assert_eq!(speakers[1].eq_gain, response().gains[1]);
        // no curve for the third speaker
        assert!(speakers[2].eq_freq.is_empty());
        assert!(!speakers[2].eq_active());
        assert_eq!(layout.array.subs[0].eq_stages, 0);
    }

    #[test]
    fn unrelated_content_is_preserved() {
        let source = layout_file(LAYOUT);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("calibrated.spk");
        save(source.path(), &dest).unwrap();

        let root = read_document(&dest).unwrap();
        assert_eq!(root.attributes.get("label").map(String::as_str), Some("keep me"));
        assert_eq!(
            root.get_child("other").and_then(|e| e.attributes.get("foo")).map(String::as_str),
            Some("bar")
        );
        let speaker = root.get_child("speaker").unwrap();
        assert_eq!(speaker.attributes.get("label").map(String::as_str), Some("L"));
        assert!(root.get_child("speakercalibconfig").is_some());
        assert!(root.get_child("subcalibconfig").is_some());
        assert_eq!(read_calibfor(&dest).unwrap().as_deref(), Some("type:nsp"));
    }

    #[test]
    fn second_save_is_stable() {
        let source = layout_file(LAYOUT);
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.spk");
        let second = dir.path().join("second.spk");
        save(source.path(), &first).unwrap();
        save(&first, &second).unwrap();

        let a = read_document(&first).unwrap();
        let b = read_document(&second).unwrap();
        for (x, y) in crate::layout::speaker_elements(&a).zip(crate::layout::speaker_elements(&b)) {
            assert_eq!(x.attributes, y.attributes);
        }
        assert_eq!(a.attributes.get("checksum"), b.attributes.get("checksum"));
    }

    #[test]
    fn wrong_root_is_rejected_without_writing() {
        let source = layout_file("<session><speaker az=\"0\"/></session>");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.spk");
        assert!(matches!(
            save(source.path(), &dest),
            Err(CalibError::InvalidLayoutType(name)) if name == "session"
        ));
        assert!(!dest.exists());
    }

    #[cfg(unix)]
    #[test]
    fn file_mode_is_kept() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let layout = dir.path().join("shared.spk");
        fs::write(&layout, LAYOUT).unwrap();
        fs::set_permissions(&layout, fs::Permissions::from_mode(0o644)).unwrap();

        save(&layout, &layout).unwrap();
        let mode = fs::metadata(&layout).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        // a new file takes the mode of the layout it was made from
        let copy = dir.path().join("copy.spk");
        save(&layout, &copy).unwrap();
        let mode = fs::metadata(&copy).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn stored_gains_are_written_back_unchanged() {
        let source = layout_file(LAYOUT);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("calibrated.spk");
        let mut array = array();
        array.speakers[0].gain = 10f64.powf(-0.7 / 20.0);
        array.speakers[1].gain = 10f64.powf(-3.1 / 20.0);
        let bb = response();
        let sub = ResponseMeasurement::default();
        let speaker_params = CalibParams::new(false);
        let sub_params = CalibParams::new(true);
        let snapshot = CalibrationSnapshot {
            caliblevel: 2e-5 * 10.0_f64.powf(94.1 / 20.0),
            diffusegain: 10.0_f64.powf(-2.3 / 20.0),
            calibfor: "type:nsp",
            array: &array,
            broadband: &bb,
            sub: &sub,
            speaker_params: &speaker_params,
            sub_params: &sub_params,
        };
        save_calibration(source.path(), &dest, &snapshot).unwrap();

        let root = read_document(&dest).unwrap();
        let attr = |elem: &Element, key: &str| elem.attributes.get(key).cloned();
        let gains: Vec<_> = crate::layout::speaker_elements(&root).map(|e| attr(e, "gain")).collect();
        assert_eq!(gains[0].as_deref(), Some("-0.7"));
        assert_eq!(gains[1].as_deref(), Some("-3.1"));
        assert_eq!(attr(&root, "caliblevel").as_deref(), Some("94.1"));
        assert_eq!(attr(&root, "diffusegain").as_deref(), Some("-2.3"));
    }

    #[test]
    fn significant_digits() {
        assert_eq!(round_significant(-0.7000000000000001, 10), -0.7);
        assert_eq!(round_significant(93.99999999999999, 10), 94.0);
        assert_eq!(round_significant(0.0, 10), 0.0);
        assert_eq!(round_significant(-1.234567890123e-5, 4), -1.235e-5);
    }

    #[test]
    fn silent_speaker_gain_is_finite() {
        assert_eq!(gain_db(0.0), MIN_GAIN_DB);
        assert_eq!(gain_db(1.0), 0.0);
        assert!((gain_db(0.5) + 6.0206).abs() < 1e-4);
    }
}
