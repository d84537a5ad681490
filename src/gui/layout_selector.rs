use std::{
    fs,
    io::{self, stdout},
    path::{Path, PathBuf},
};

use crate::gui::error::CalibGuiError;

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

/// File extensions that speaker layouts are usually stored with.
const LAYOUT_EXTENSIONS: [&str; 2] = ["spk", "xml"];

/// The layout files directly inside `dir`, sorted by name.
pub fn find_layouts(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut layouts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_layout = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| LAYOUT_EXTENSIONS.contains(&ext));
        if path.is_file() && is_layout {
            layouts.push(path);
        }
    }
    layouts.sort();
    Ok(layouts)
}

/// Lets the user pick one of `available_layouts`. None if the user quits or
/// there is nothing to pick from.
pub fn layout_selector(
    mut available_layouts: Vec<PathBuf>,
) -> Result<Option<PathBuf>, CalibGuiError> {
    let n_layouts = available_layouts.len();
    if n_layouts == 0 {
        return Ok(None);
    }

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut cursor = 0;
    let mut list_state = ListState::default().with_selected(Some(cursor));
    let mut selected_layout = None;
    loop {
        let title = Title::from(" Speaker Layouts ".magenta().bold());
        let instructions = Title::from(Line::from(vec![
            " Navigate ".into(),
            "<Up>/<Down>".magenta().bold(),
            " Select ".into(),
            "<Enter>".magenta().bold(),
            " Quit ".into(),
            "<Q> ".magenta().bold(),
        ]));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);
        let names = available_layouts.iter().map(|p| p.to_string_lossy());
        let list = List::new(names)
            .style(Style::default().fg(Color::White))
            .highlight_symbol(">>")
            .highlight_style(Style::default().fg(Color::Magenta))
            .block(block);
        list_state.select(Some(cursor));
        terminal.draw(|frame| {
            let area = frame.size();
            frame.render_stateful_widget(list, area, &mut list_state);
        })?;
        if event::poll(std::time::Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Down => {
                            cursor = (cursor + 1) % n_layouts;
                        }
                        KeyCode::Up => {
                            cursor = (cursor + n_layouts - 1) % n_layouts;
                        }
                        KeyCode::Enter => {
                            selected_layout = Some(cursor);
                            break;
                        }
                        KeyCode::Char('q') => break,
                        _ => {}
                    }
                }
            }
        }
    }

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(selected_layout.map(|i| available_layouts.swap_remove(i)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_layout_files_are_found() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.spk", "a.xml", "notes.txt", "c.spk.bak"] {
            fs::write(dir.path().join(name), "<layout/>").unwrap();
        }
        fs::create_dir(dir.path().join("d.spk")).unwrap();

        let found = find_layouts(dir.path()).unwrap();
        assert_eq!(found, vec![dir.path().join("a.xml"), dir.path().join("b.spk")]);
    }

    #[test]
    fn nothing_to_select() {
        assert!(layout_selector(vec![]).unwrap().is_none());
    }
}
