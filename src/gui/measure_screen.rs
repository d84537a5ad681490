use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::spawn,
    time::Duration,
};

use crate::{
    calib_session::CalibSession,
    engine::RenderEngine,
    error::CalibError,
    gui::error::CalibGuiError,
    layout::SpeakerGroup,
    measurement::{Pass, Progress},
};

use crossterm::event::{self, KeyEventKind};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

/// One line describing what is being measured.
pub fn describe(progress: &Progress) -> String {
    let group = match progress.group {
        SpeakerGroup::Broadband => "speaker",
        SpeakerGroup::Subwoofer => "subwoofer",
    };
    let pass = match progress.pass {
        Pass::Response => "frequency response",
        Pass::Level => "level",
    };
    format!(
        "{} of {} {} / {}",
        pass,
        group,
        progress.speaker + 1,
        progress.count
    )
}

/// Runs [CalibSession::measure_with] on its own thread while showing its
/// progress. Any key sets `abort`, which stops the measurement before the
/// next speaker.
///
/// The session is handed back together with the result of the measurement.
pub fn measure_screen<B, E>(
    terminal: &mut Terminal<B>,
    mut session: CalibSession<E>,
    abort: &Arc<AtomicBool>,
) -> Result<(CalibSession<E>, Result<(), CalibError>), CalibGuiError>
where
    B: Backend,
    E: RenderEngine + Send + 'static,
{
    abort.store(false, Ordering::SeqCst);
    let (progress_tx, progress_rx) = mpsc::channel::<Progress>();

    let th = spawn(move || {
        let result = session.measure_with(&mut |p| {
            // the screen may be gone already
            let _ = progress_tx.send(p);
        });
        (session, result)
    });

    let mut last = None;
    while !th.is_finished() {
        while let Ok(progress) = progress_rx.try_recv() {
            last = Some(progress);
        }

        let aborting = abort.load(Ordering::SeqCst);
        let title = Title::from(" Measuring Speakers... ".magenta().bold());
        let label = match (&last, aborting) {
            (_, true) => "stopping after this speaker".to_string(),
            (Some(p), false) => describe(p),
            (None, false) => "starting".to_string(),
        };
        let ratio = last
            .map(|p| (p.speaker + 1) as f64 / p.count.max(1) as f64)
            .unwrap_or(0.0);
        let gauge = Gauge::default()
            .block(
                Block::default()
                    .title(title.alignment(Alignment::Center))
                    .title(
                        Title::from(Line::from(vec![" Abort ".into(), "<any key> ".magenta().bold()]))
                            .alignment(Alignment::Center)
                            .position(Position::Bottom),
                    )
                    .borders(Borders::ALL),
            )
            .gauge_style(Style::default().fg(Color::Magenta))
            .ratio(ratio.clamp(0.0, 1.0))
            .label(label);
        terminal.draw(|frame| {
            let area = frame.size();
            frame.render_widget(gauge, area);
        })?;

        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    abort.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    th.join().map_err(|_| CalibGuiError::JoinError)
}
