//! Command line arguments of the `spkcalib` and `calibmonitor` binaries.

use std::{
    path::{Path, PathBuf},
    sync::mpsc::channel,
    thread,
};

use clap::{Args, Parser, Subcommand};
use log::warn;

use crate::{
    calib_session::CalibSession,
    component::run_component,
    error::CalibError,
    params::{load_params, CalibParams},
    recording_writer::{RecordingWriter, Take},
    sim_engine::{SimConfig, SimEngine},
};

/// Batch calibration of speaker layouts.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct CalibArgs {
    #[command(subcommand, long_about)]
    /// Which task to perform, calibration or verification of a layout
    pub command: CommandTask,
}

/// Task to perform
#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Measure a speaker layout and write the calibration into it
    #[command(about)]
    Calibrate(CalibrateCommand),

    /// Print a layout and check its checksum
    #[command(about)]
    Verify(VerifyCommand),
}

/// Arguments of `spkcalib calibrate`.
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct CalibrateCommand {
    /// Speaker layout file to calibrate
    pub layout: PathBuf,

    /// Write the calibrated layout here instead of over the input
    #[arg(short = 'o', long = "out")]
    pub outfile: Option<PathBuf>,

    /// Change of the reference level after measuring, in dB
    #[arg(long = "level-delta", default_value_t = 0.0, allow_hyphen_values = true)]
    pub level_delta: f64,

    /// Change of the diffuse gain after measuring, in dB
    #[arg(long = "diffuse-delta", default_value_t = 0.0, allow_hyphen_values = true)]
    pub diffuse_delta: f64,

    /// Engine and measurement options
    #[command(flatten)]
    pub engine: EngineOptions,
}

/// Arguments of `spkcalib verify`.
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct VerifyCommand {
    /// Speaker layout file to check
    pub layout: PathBuf,
}

/// Interactive calibration console.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct MonitorArgs {
    /// Speaker layout file to calibrate. Without one, a layout from the
    /// current directory can be picked.
    pub layout: Option<PathBuf>,

    /// Engine and measurement options
    #[command(flatten)]
    pub engine: EngineOptions,
}

/// Options of the rendering engine and the measurement, shared by both
/// binaries.
#[derive(Debug, Args, Clone)]
pub struct EngineOptions {
    /// Sample rate of the engine, in Hz
    #[arg(short = 's', long = "samp", default_value_t = 48000.0)]
    pub samp_rate: f64,

    /// Number of simulated microphones
    #[arg(long = "mics", default_value_t = 4)]
    pub mics: usize,

    /// Render in real time instead of as fast as possible
    #[arg(long = "realtime")]
    pub realtime: bool,

    /// Seed of the simulated room
    #[arg(long = "seed", default_value_t = 1)]
    pub seed: u64,

    /// Capture ports of the reference microphones, all simulated
    /// microphones if not given
    #[arg(short = 'r', long = "ref-port")]
    #[clap(num_args = 1..)]
    pub ref_ports: Vec<String>,

    /// RON file with site defaults of the measurement parameters
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Maximum number of correction stages per broadband speaker
    #[arg(long = "eq-stages")]
    pub eq_stages: Option<usize>,

    /// Maximum number of correction stages per subwoofer
    #[arg(long = "sub-eq-stages")]
    pub sub_eq_stages: Option<usize>,

    /// Directory to write every capture to, as WAV files
    #[arg(long = "dump")]
    pub dump: Option<PathBuf>,
}

impl EngineOptions {
    /// Configuration of the simulated engine.
    pub fn sim_config(&self) -> SimConfig {
        SimConfig {
            sample_rate: self.samp_rate,
            mics: self.mics,
            realtime: self.realtime,
            seed: self.seed,
            ..Default::default()
        }
    }

    /// The given reference ports, or every simulated microphone.
    pub fn ref_ports(&self) -> Vec<String> {
        if self.ref_ports.is_empty() {
            (1..=self.mics)
                .map(|n| format!("system:capture_{}", n))
                .collect()
        } else {
            self.ref_ports.clone()
        }
    }

    /// Measurement parameters for `layout`, with the stage limits given on
    /// the command line applied last.
    pub fn params(&self, layout: &Path) -> Result<(CalibParams, CalibParams), CalibError> {
        let (mut speaker, mut sub) = load_params(layout, self.config.as_deref())?;
        if let Some(stages) = self.eq_stages {
            speaker.maxeqstages = stages;
        }
        if let Some(stages) = self.sub_eq_stages {
            sub.maxeqstages = stages;
        }
        Ok((speaker, sub))
    }

    /// Starts the simulated engine and builds a calibration session for
    /// `layout` on it. With `--dump`, every capture is written to disk on
    /// a background thread.
    pub fn open_session(&self, layout: &Path) -> Result<CalibSession<SimEngine>, CalibError> {
        let (par_speaker, par_sub) = self.params(layout)?;
        let engine = SimEngine::new(self.sim_config());
        let mut session = CalibSession::new(engine, layout, self.ref_ports(), par_speaker, par_sub)?;

        if let Some(dir) = &self.dump {
            let writer = RecordingWriter::new(dir)?;
            let (take_tx, take_rx) = channel::<Take>();
            let (result_tx, result_rx) = channel();
            run_component(Box::new(writer), take_rx, result_tx);
            thread::spawn(move || {
                for result in result_rx {
                    if let Err(e) = result {
                        warn!("could not write capture: {}", e);
                    }
                }
            });
            session.set_dump(take_tx);
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibrate_command_line() {
        let args = CalibArgs::parse_from([
            "spkcalib",
            "calibrate",
            "room.spk",
            "--level-delta",
            "-1.5",
            "--eq-stages",
            "3",
            "-r",
            "system:capture_1",
            "system:capture_3",
        ]);
        let CommandTask::Calibrate(cmd) = args.command else {
            panic!("expected the calibrate command");
        };
        assert_eq!(cmd.layout, PathBuf::from("room.spk"));
        assert_eq!(cmd.level_delta, -1.5);
        assert_eq!(cmd.diffuse_delta, 0.0);
        assert_eq!(cmd.engine.eq_stages, Some(3));
        assert_eq!(cmd.engine.ref_ports(), vec!["system:capture_1", "system:capture_3"]);
        assert!(cmd.outfile.is_none());
    }

    #[test]
    fn default_ports_are_all_microphones() {
        let args = MonitorArgs::parse_from(["calibmonitor", "--mics", "2"]);
        assert!(args.layout.is_none());
        assert_eq!(args.engine.ref_ports(), vec!["system:capture_1", "system:capture_2"]);
        assert_eq!(args.engine.sim_config().mics, 2);
        assert_eq!(args.engine.sim_config().sample_rate, 48000.0);
    }
}
