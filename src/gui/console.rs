use std::{
    io::stdout,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use crate::{
    calib_session::CalibSession,
    engine::RenderEngine,
    error::CalibError,
    gui::{error::CalibGuiError, measure_screen::measure_screen},
};

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

/// What the target receiver is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Listening {
    /// Nothing plays
    #[default]
    Off,
    /// The broadband stimulus from the front
    Broadband,
    /// The diffuse field
    Diffuse,
}

/// Everything the console can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// Measure every speaker
    Measure,
    /// Start or stop the broadband stimulus
    ToggleBroadband,
    /// Start or stop the diffuse field
    ToggleDiffuse,
    /// Change of the reference level in dB
    Level(f64),
    /// Change of the diffuse gain in dB
    Diffuse(f64),
    /// Set every speaker gain back to 1
    ResetLevels,
    /// Write the calibration into the layout
    Save,
    /// Leave the console
    Quit,
}

/// The action bound to a key, if any.
pub fn action_for(code: KeyCode) -> Option<Action> {
    match code {
        KeyCode::Char('m') => Some(Action::Measure),
        KeyCode::Char('b') => Some(Action::ToggleBroadband),
        KeyCode::Char('d') => Some(Action::ToggleDiffuse),
        KeyCode::Up => Some(Action::Level(1.0)),
        KeyCode::Down => Some(Action::Level(-1.0)),
        KeyCode::Right => Some(Action::Level(0.1)),
        KeyCode::Left => Some(Action::Level(-0.1)),
        KeyCode::Char('+') => Some(Action::Diffuse(1.0)),
        KeyCode::Char('-') => Some(Action::Diffuse(-1.0)),
        KeyCode::Char('r') => Some(Action::ResetLevels),
        KeyCode::Char('s') => Some(Action::Save),
        KeyCode::Char('q') | KeyCode::Esc => Some(Action::Quit),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Console {
    listening: Listening,
    status: String,
    quit_armed: bool,
}

impl Console {
    /// Applies everything but [Action::Measure]. Returns whether the console
    /// should close.
    fn apply<E: RenderEngine>(
        &mut self,
        session: &mut CalibSession<E>,
        action: Action,
    ) -> Result<bool, CalibError> {
        if action != Action::Quit {
            self.quit_armed = false;
        }
        match action {
            Action::Measure => {}
            Action::ToggleBroadband => {
                let on = self.listening != Listening::Broadband;
                session.set_active(on)?;
                self.listening = if on { Listening::Broadband } else { Listening::Off };
            }
            Action::ToggleDiffuse => {
                let on = self.listening != Listening::Diffuse;
                session.set_active_diffuse(on)?;
                self.listening = if on { Listening::Diffuse } else { Listening::Off };
            }
            Action::Level(delta) => {
                session.inc_caliblevel(delta)?;
                self.status = format!("reference level {:.1} dB SPL", session.caliblevel_db()?);
            }
            Action::Diffuse(delta) => {
                session.inc_diffusegain(delta)?;
                self.status = format!("diffuse gain {:.1} dB", session.diffusegain_db()?);
            }
            Action::ResetLevels => {
                session.reset_levels();
                self.status = "speaker gains reset".to_string();
            }
            Action::Save => {
                session.save()?;
                self.status = format!("saved {}", session.layout_path().display());
            }
            Action::Quit => {
                if session.modified() && !self.quit_armed {
                    self.quit_armed = true;
                    self.status = "unsaved changes, press q again to quit".to_string();
                } else {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Mutes whatever is playing, before measuring.
    fn silence<E: RenderEngine>(&mut self, session: &mut CalibSession<E>) -> Result<(), CalibError> {
        match self.listening {
            Listening::Off => {}
            Listening::Broadband => session.set_active(false)?,
            Listening::Diffuse => session.set_active_diffuse(false)?,
        }
        self.listening = Listening::Off;
        Ok(())
    }
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

/// One table row per speaker and subwoofer of the target receiver.
fn speaker_rows<E: RenderEngine>(session: &CalibSession<E>) -> Vec<[String; 7]> {
    let array = session.receivers()[1].read();
    let measured = session.levels_recorded();
    let groups = [
        ("", &array.speakers, session.levels()),
        ("sub ", &array.subs, session.sub_levels()),
    ];
    let mut rows = Vec::new();
    for (prefix, entries, levels) in groups {
        for (k, entry) in entries.iter().enumerate() {
            let level = |values: &[f64]| match values.get(k) {
                Some(v) if measured => format!("{:.1}", v),
                _ => "-".to_string(),
            };
            rows.push([
                format!("{}{}", prefix, k + 1),
                entry.label.clone(),
                format!("{:.0}/{:.0}", entry.direction.azimuth(), entry.direction.elevation()),
                level(&levels.levels),
                level(&levels.ranges),
                format!("{:.2}", 20.0 * entry.gain.max(1e-10).log10()),
                entry.eq_stages.to_string(),
            ]);
        }
    }
    rows
}

fn ui<E: RenderEngine>(frame: &mut Frame, session: &CalibSession<E>, console: &Console) {
    let level = session
        .caliblevel_db()
        .map(|l| format!("{:.1} dB SPL", l))
        .unwrap_or_else(|e| e.to_string());
    let diffuse = session
        .diffusegain_db()
        .map(|g| format!("{:.1} dB", g))
        .unwrap_or_else(|e| e.to_string());
    let listening = match console.listening {
        Listening::Off => "nothing",
        Listening::Broadband => "broadband",
        Listening::Diffuse => "diffuse",
    };
    let highlight = Style::default()
        .fg(Color::Magenta)
        .add_modifier(Modifier::BOLD);
    let header = Paragraph::new(vec![
        Line::from(vec![
            "layout ".into(),
            Span::styled(
                session.layout_path().to_string_lossy().to_string(),
                Style::default().add_modifier(Modifier::BOLD),
            ),
            "  for ".into(),
            Span::styled(
                session.calibfor().to_string(),
                Style::default().add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            "reference level ".into(),
            Span::styled(level, highlight),
            "  diffuse gain ".into(),
            Span::styled(diffuse, highlight),
            "  playing ".into(),
            listening.bold(),
        ]),
        Line::from(format!(
            "measured {}  level set {}  diffuse set {}{}",
            yes_no(session.levels_recorded()),
            yes_no(session.calibrated()),
            yes_no(session.calibrated_diffuse()),
            if session.modified() { "  (unsaved)" } else { "" }
        )),
        Line::from(Span::styled(
            console.status.clone(),
            Style::default().fg(Color::Yellow),
        )),
    ])
    .block(
        Block::default()
            .title(Title::from(" Speaker Calibration ".magenta().bold()).alignment(Alignment::Center))
            .borders(Borders::ALL),
    );

    let rows = speaker_rows(session).into_iter().map(Row::new);
    let table = Table::new(
        rows,
        [
            Constraint::Length(7),
            Constraint::Length(10),
            Constraint::Length(9),
            Constraint::Length(8),
            Constraint::Length(8),
            Constraint::Length(8),
            Constraint::Length(4),
        ],
    )
    .header(
        Row::new(["#", "label", "az/el", "dB SPL", "range", "gain", "eq"])
            .style(highlight),
    )
    .block(
        Block::default()
            .title(
                Title::from(Line::from(vec![
                    " Measure ".into(),
                    "<M>".magenta().bold(),
                    " Broadband ".into(),
                    "<B>".magenta().bold(),
                    " Diffuse ".into(),
                    "<D>".magenta().bold(),
                    " Level ".into(),
                    "<Up>/<Down>/<Left>/<Right>".magenta().bold(),
                    " Diffuse gain ".into(),
                    "<+>/<->".magenta().bold(),
                    " Reset ".into(),
                    "<R>".magenta().bold(),
                    " Save ".into(),
                    "<S>".magenta().bold(),
                    " Quit ".into(),
                    "<Q> ".magenta().bold(),
                ]))
                .alignment(Alignment::Center)
                .position(Position::Bottom),
            )
            .borders(Borders::ALL),
    );

    let areas = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(6), Constraint::Min(3)])
        .split(frame.size());
    frame.render_widget(header, areas[0]);
    frame.render_widget(table, areas[1]);
}

fn run_console<B, E>(
    terminal: &mut Terminal<B>,
    mut session: CalibSession<E>,
    abort: &Arc<AtomicBool>,
) -> Result<CalibSession<E>, CalibGuiError>
where
    B: Backend,
    E: RenderEngine + Send + 'static,
{
    let mut console = Console::default();
    loop {
        terminal.draw(|frame| ui(frame, &session, &console))?;

        if !event::poll(Duration::from_millis(250))? {
            continue;
        }
        let event::Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let Some(action) = action_for(key.code) else {
            continue;
        };

        if action == Action::Measure {
            console.quit_armed = false;
            if let Err(e) = console.silence(&mut session) {
                console.status = e.to_string();
                continue;
            }
            let (returned, result) = measure_screen(terminal, session, abort)?;
            session = returned;
            console.status = match result {
                Ok(()) => {
                    let stats = session.stats();
                    format!(
                        "levels between {:.1} and {:.1} dB SPL, mean {:.1} dB SPL",
                        stats.lmin, stats.lmax, stats.lmean
                    )
                }
                Err(e) => e.to_string(),
            };
            continue;
        }

        match console.apply(&mut session, action) {
            Ok(true) => return Ok(session),
            Ok(false) => {}
            Err(e) => console.status = e.to_string(),
        }
    }
}

/// Runs the interactive calibration console until the user quits, then
/// hands the session back.
pub fn calib_console<E>(mut session: CalibSession<E>) -> Result<CalibSession<E>, CalibGuiError>
where
    E: RenderEngine + Send + 'static,
{
    let abort = Arc::new(AtomicBool::new(false));
    session.set_abort(Arc::clone(&abort));

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let res = run_console(&mut terminal, session, &abort);

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::SpeakerReceiver,
        layout::{Direction, SpeakerArray, SpeakerEntry},
        measurement::tests::{quick_params, MockEngine},
    };
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn session() -> (CalibSession<MockEngine>, NamedTempFile) {
        let mut layout = NamedTempFile::new().unwrap();
        write!(layout, r#"<layout><speaker az="0"/><speaker az="90"/></layout>"#).unwrap();
        let array = || {
            SpeakerReceiver::new(
                "nsp",
                SpeakerArray::new(
                    vec![
                        SpeakerEntry::new(Direction::from_degrees(0.0, 0.0)),
                        SpeakerEntry::new(Direction::from_degrees(90.0, 0.0)),
                    ],
                    vec![],
                ),
            )
        };
        let mut engine = MockEngine::new(vec![(90, 64.0)]);
        engine.receivers = vec![Some(array()), Some(array()), None];
        let session = CalibSession::new(
            engine,
            layout.path(),
            vec!["system:capture_1".to_string()],
            quick_params(false),
            quick_params(true),
        )
        .unwrap();
        (session, layout)
    }

    #[test]
    fn keys() {
        assert_eq!(action_for(KeyCode::Char('m')), Some(Action::Measure));
        assert_eq!(action_for(KeyCode::Down), Some(Action::Level(-1.0)));
        assert_eq!(action_for(KeyCode::Char('+')), Some(Action::Diffuse(1.0)));
        assert_eq!(action_for(KeyCode::Esc), Some(Action::Quit));
        assert_eq!(action_for(KeyCode::Char('x')), None);
    }

    #[test]
    fn toggles_switch_between_stimuli() {
        let (mut s, _layout) = session();
        let mut console = Console::default();
        console.apply(&mut s, Action::ToggleBroadband).unwrap();
        assert_eq!(console.listening, Listening::Broadband);
        console.apply(&mut s, Action::ToggleDiffuse).unwrap();
        assert_eq!(console.listening, Listening::Diffuse);
        console.apply(&mut s, Action::ToggleDiffuse).unwrap();
        assert_eq!(console.listening, Listening::Off);
        assert!(s.calibrated() && s.calibrated_diffuse());
    }

    #[test]
    fn quitting_with_changes_needs_confirmation() {
        let (mut s, _layout) = session();
        let mut console = Console::default();
        assert!(console.apply(&mut s, Action::Quit).unwrap());

        console.apply(&mut s, Action::Level(1.0)).unwrap();
        assert_eq!(console.status, "reference level 94.0 dB SPL");
        assert!(!console.apply(&mut s, Action::Quit).unwrap());
        assert!(console.apply(&mut s, Action::Quit).unwrap());

        // anything in between disarms the confirmation
        console.apply(&mut s, Action::Quit).unwrap();
        console.apply(&mut s, Action::Diffuse(-1.0)).unwrap();
        assert!(!console.apply(&mut s, Action::Quit).unwrap());
    }

    #[test]
    fn rows_show_levels_once_measured() {
        let (mut s, _layout) = session();
        let rows = speaker_rows(&s);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][3], "-");

        s.measure().unwrap();
        let rows = speaker_rows(&s);
        assert_eq!(rows[1][3], "64.0");
        assert_eq!(rows[1][5], "0.00");
        assert_eq!(rows[0][5], "-6.00");
        assert_eq!(rows[1][2], "90/0");
    }

    #[test]
    fn silence_before_measuring() {
        let (mut s, _layout) = session();
        let mut console = Console::default();
        console.apply(&mut s, Action::ToggleDiffuse).unwrap();
        console.silence(&mut s).unwrap();
        assert_eq!(console.listening, Listening::Off);
    }
}
