//! Batch speaker calibration on the simulated engine.

use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use spkcalib::{
    args::{
        CalibArgs, CalibrateCommand,
        CommandTask::{Calibrate, Verify},
        VerifyCommand,
    },
    calib_session::CalibSession,
    engine::RenderEngine,
    error::CalibError,
    layout::SpeakerLayout,
    peq::DEFAULT_SAMPLE_RATE,
};

// Example:
// cargo run --bin spkcalib --
//                          calibrate   studio.spk
//                          --mics      4
//                          --eq-stages 3
//                          --level-delta -1.5
//                          --out       studio-calibrated.spk

fn main() -> ExitCode {
    env_logger::init();
    let args = CalibArgs::parse();

    let result = match args.command {
        Calibrate(cmd) => calibrate(cmd).map(|()| true),
        Verify(cmd) => verify(cmd),
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            eprintln!("spkcalib: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_levels<E: RenderEngine>(session: &CalibSession<E>) {
    let array = session.receivers()[1].read();
    let groups = [
        ("speaker", &array.speakers, session.levels()),
        ("sub", &array.subs, session.sub_levels()),
    ];
    for (name, entries, measured) in groups {
        for (k, entry) in entries.iter().enumerate() {
            println!(
                "{:>7} {:>2}  az {:>6.1}  el {:>5.1}  level {:>6.2} dB SPL  range {:>5.2} dB  gain {:>6.2} dB  eq {}",
                name,
                k + 1,
                entry.direction.azimuth(),
                entry.direction.elevation(),
                measured.levels.get(k).copied().unwrap_or(f64::NAN),
                measured.ranges.get(k).copied().unwrap_or(f64::NAN),
                20.0 * entry.gain.log10(),
                entry.eq_stages
            );
        }
    }
    let stats = session.stats();
    println!(
        "min {:.2} dB SPL, max {:.2} dB SPL, mean {:.2} dB SPL",
        stats.lmin, stats.lmax, stats.lmean
    );
}

fn calibrate(cmd: CalibrateCommand) -> Result<(), CalibError> {
    let mut session = cmd.engine.open_session(&cmd.layout)?;
    session.measure()?;
    print_levels(&session);

    if cmd.level_delta != 0.0 {
        session.set_active(true)?;
        session.inc_caliblevel(cmd.level_delta)?;
        info!("reference level {:.2} dB SPL", session.caliblevel_db()?);
    }
    if cmd.diffuse_delta != 0.0 {
        session.set_active_diffuse(true)?;
        session.inc_diffusegain(cmd.diffuse_delta)?;
        info!("diffuse gain {:.2} dB", session.diffusegain_db()?);
    }
    session.set_active(false)?;
    session.set_active_diffuse(false)?;

    match &cmd.outfile {
        Some(path) => {
            session.save_as(path)?;
            println!("saved {}", path.display());
        }
        None => {
            session.save()?;
            println!("saved {}", cmd.layout.display());
        }
    }
    Ok(())
}

/// Prints the layout and whether its checksum holds. False if it does not.
fn verify(cmd: VerifyCommand) -> Result<bool, CalibError> {
    let layout = SpeakerLayout::from_path(&cmd.layout, DEFAULT_SAMPLE_RATE)?;
    println!("{}", cmd.layout.display());
    println!(
        "  {} speakers, {} subs, caliblevel {:.2} dB SPL, diffusegain {:.2} dB",
        layout.array.speakers.len(),
        layout.array.subs.len(),
        layout.caliblevel_db,
        layout.diffusegain_db
    );
    println!(
        "  calibrated for '{}' on {}",
        layout.calibfor.as_deref().unwrap_or("-"),
        layout.calibdate.as_deref().unwrap_or("-")
    );
    for (k, entry) in layout.array.entries().enumerate() {
        println!(
            "  {:>2} {:<10} az {:>6.1} el {:>5.1} gain {:>6.2} dB eq {}",
            k + 1,
            entry.label,
            entry.direction.azimuth(),
            entry.direction.elevation(),
            20.0 * entry.gain.log10(),
            entry.eq
        );
    }

    let ok = match SpeakerLayout::verify(&cmd.layout)? {
        Some(true) => {
            println!("  checksum ok");
            true
        }
        Some(false) => {
            println!("  checksum MISMATCH, modified after calibration");
            false
        }
        None => {
            println!("  not calibrated, no checksum");
            true
        }
    };
    Ok(ok)
}
