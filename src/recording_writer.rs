//! A [Component] that writes every capture of a calibration run to its own
//! multichannel WAV file, for inspecting a measurement afterwards.

use crate::component::{Component, ComponentError};
use hound::{SampleFormat, WavSpec, WavWriter};
use log::debug;

use std::{
    fmt,
    path::{Path, PathBuf},
};

/// One capture: a buffer per recorded port, all of the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct Take {
    /// File stem, e.g. `speaker-level-03`
    pub label: String,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// One buffer per captured port
    pub channels: Vec<Vec<f32>>,
}

/// Writes each [Take] it receives to `<dir>/<label>.wav` as 32 bit float.
pub struct RecordingWriter {
    dir: PathBuf,
    written: usize,
}

impl RecordingWriter {
    /// Instantiates a new RecordingWriter that writes into `dir`, creating
    /// the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, ComponentError> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            written: 0,
        })
    }

    fn write_take(&self, take: &Take) -> Result<PathBuf, ComponentError> {
        let spec = WavSpec {
            channels: take.channels.len().max(1) as u16,
            sample_rate: take.sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let path = self.dir.join(format!("{}.wav", take.label));
        let mut writer = WavWriter::create(&path, spec)?;

        let frames = take.channels.iter().map(Vec::len).min().unwrap_or(0);
        // interleave the channels frame by frame
        for i in 0..frames {
            for channel in &take.channels {
                writer.write_sample(channel[i])?;
            }
        }
        writer.finalize()?;
        Ok(path)
    }
}

impl Component for RecordingWriter {
    type InData = Take;
    type OutData = Result<PathBuf, ComponentError>;

    fn convert(&mut self, input: Take) -> Result<PathBuf, ComponentError> {
        let path = self.write_take(&input)?;
        self.written += 1;
        debug!("wrote {}", path.display());
        Ok(path)
    }

    /// Every take is finalized as soon as it is written.
    fn finalize(&mut self) -> Result<(), ComponentError> {
        debug!("{} takes written to {}", self.written, self.dir.display());
        Ok(())
    }
}

impl fmt::Display for RecordingWriter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RecordingWriter")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::run_component;
    use hound::WavReader;
    use std::sync::mpsc::channel;

    fn ramp(n: usize, scale: f32) -> Vec<f32> {
        (0..n).map(|i| i as f32 * scale).collect()
    }

    /// Write a three channel take through the component thread and read it
    /// back with a WavReader.
    #[test]
    fn takes_are_written_interleaved() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RecordingWriter::new(dir.path().join("takes")).unwrap();

        let (take_tx, take_rx) = channel::<Take>();
        let (result_tx, result_rx) = channel();
        run_component(Box::new(writer), take_rx, result_tx);

        let take = Take {
            label: "speaker-level-00".to_string(),
            sample_rate: 48000,
            channels: vec![ramp(100, 0.001), ramp(100, -0.001), ramp(100, 0.5)],
        };
        assert!(take_tx.send(take.clone()).is_ok());
        let path = result_rx.recv().unwrap().unwrap();
        assert_eq!(path, dir.path().join("takes").join("speaker-level-00.wav"));

        let mut reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 3);
        assert_eq!(reader.spec().sample_rate, 48000);
        let samples = reader
            .samples::<f32>()
            .collect::<Result<Vec<f32>, hound::Error>>()
            .unwrap();
        for (ch, channel) in take.channels.iter().enumerate() {
            let read: Vec<f32> = samples.iter().skip(ch).step_by(3).cloned().collect();
            assert_eq!(&read, channel);
        }
    }

    #[test]
    fn unwritable_directory_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(RecordingWriter::new(file.path().join("sub")).is_err());
    }
}
