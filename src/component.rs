//! Defines the Component trait for work that runs beside a calibration on
//! its own thread, such as writing the captured audio to disk. A component
//! consumes data from an input channel, processes it, and passes the result
//! to an output channel, so that slow work never delays the next capture.

use log::{info, warn};
use std::fmt;
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Failure of a component while cleaning up.
#[derive(Debug)]
pub enum ComponentError {
    /// Writing a WAV file failed
    HoundError(hound::Error),
    /// Any other I/O failure
    IoError(std::io::Error),
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ComponentError::HoundError(e) => write!(f, "wav error: {}", e),
            ComponentError::IoError(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ComponentError {}

impl From<hound::Error> for ComponentError {
    fn from(value: hound::Error) -> Self {
        Self::HoundError(value)
    }
}

impl From<std::io::Error> for ComponentError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}

/// A processing stage that runs on its own thread. Background work of a
/// calibration run implements Component and is started with
/// [run_component].
pub trait Component: fmt::Display {
    type InData;
    type OutData;

    /// Processes one input
    fn convert(&mut self, input: Self::InData) -> Self::OutData;

    /// Cleans up once the input channel is closed
    fn finalize(&mut self) -> Result<(), ComponentError>;
}

/// Runs the given Component on its own thread. On receiving data of type
/// InData on the input channel, the Component converts them to data of type
/// OutData and sends it to the output channel. The thread ends when every
/// sender of the input channel is dropped.
pub fn run_component<C: Component + std::marker::Send + 'static>(
    mut component: Box<C>,
    input: Receiver<<C as Component>::InData>,
    output: Sender<<C as Component>::OutData>,
) -> JoinHandle<()>
where
    <C as Component>::InData: Send + 'static,
    <C as Component>::OutData: Send + 'static,
{
    thread::spawn(move || {
        while let Ok(data) = input.recv() {
            let out_data = component.convert(data);
            if let Err(error) = output.send(out_data) {
                warn!("{}: output closed, dropping result ({})", component, error);
            }
        }

        if let Err(component_error) = component.finalize() {
            warn!("{}: could not finish: {}", component, component_error);
        }
        info!("{} finished", component);
    })
}
