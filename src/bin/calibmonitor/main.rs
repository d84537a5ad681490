//! Interactive speaker calibration console on the simulated engine.

use std::{error::Error, path::Path};

use clap::Parser;
use spkcalib::{
    args::MonitorArgs,
    gui::{calib_console, find_layouts, layout_selector},
};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = MonitorArgs::parse();

    let layout = match args.layout {
        Some(layout) => layout,
        None => match layout_selector(find_layouts(Path::new("."))?)? {
            Some(layout) => layout,
            None => {
                println!("no layout selected");
                return Ok(());
            }
        },
    };

    let session = args.engine.open_session(&layout)?;
    let session = calib_console(session)?;
    if session.modified() {
        println!("{} was not saved", layout.display());
    }
    Ok(())
}
