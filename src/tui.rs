//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the server list and the selected server's log ring with `ratatui`.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, Clear, List, ListItem, ListState, Paragraph};
use ratatui::Terminal;

use crate::app::{App, StatusLevel};
use crate::manager::{Manager, ServerState, StatusReport};
use crate::output::{sanitize_text, LogRing};

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

const HELP_LINE: &str =
    "Up/Down select | s start | x stop | r restart | c clear | PgUp/PgDn scroll | f follow | ? help | q quit";

/// Enables raw mode, enters the alternate screen, and creates the terminal.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    Terminal::new(CrosstermBackend::new(stdout))
}

/// Restores the terminal to its original state.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Draws the current application state to the terminal.
///
/// Log lines are read straight from the selected server's ring, one screenful at a
/// time, so redraw cost does not grow with the ring size.
pub fn draw(app: &mut App, terminal: &mut TuiTerminal, manager: &Manager) -> io::Result<()> {
    let title = match app.selected_server() {
        Some(server) => format!("devrack · {}", server.name),
        None => "devrack".to_string(),
    };
    execute!(terminal.backend_mut(), SetTitle(title))?;
    terminal.draw(|frame| {
        let area = frame.size();
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(4)])
            .split(area);
        let main = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(28), Constraint::Percentage(72)])
            .split(vertical[0]);

        let border_style = Style::default().fg(Color::DarkGray);
        let items: Vec<ListItem> = app
            .servers
            .iter()
            .enumerate()
            .map(|(idx, server)| server_item(server, idx == app.selected))
            .collect();
        let list = List::new(items).block(
            Block::default()
                .title("Servers")
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        frame.render_stateful_widget(list, main[0], &mut list_state(app.selected, app.servers.len()));

        let ring = app
            .selected_server()
            .and_then(|server| manager.log_ring(&server.name).ok());
        let log_block = Block::default()
            .title(log_title(app.selected_server(), ring.as_deref()))
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(border_style);
        let log_area = log_block.inner(main[1]);
        app.log_view_height = log_area.height as usize;

        let (text, total) = match &ring {
            Some(ring) => render_log_lines(app, ring, log_area.width as usize),
            None => (Text::default(), 0),
        };
        frame.render_widget(Paragraph::new(text).block(log_block), main[1]);
        if total == 0 {
            let empty = Paragraph::new("No output yet").style(Style::default().fg(Color::DarkGray));
            frame.render_widget(empty, log_area);
        }

        let (help_line, help_style) = match app.status_message() {
            Some((message, StatusLevel::Warning)) => {
                (message.to_string(), Style::default().fg(Color::Yellow))
            }
            Some((message, StatusLevel::Info)) => {
                (message.to_string(), Style::default().fg(Color::Gray))
            }
            None => (HELP_LINE.to_string(), Style::default().fg(Color::DarkGray)),
        };
        let status = Paragraph::new(Text::from(vec![
            Line::from(Span::raw(app.status_line())),
            Line::from(Span::styled(help_line, help_style)),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        frame.render_widget(status, vertical[1]);

        if app.show_help {
            let popup_area = centered_rect(60, 60, area);
            let help_text = [
                "Navigation:",
                "  Up/Down    Select server",
                "  PgUp/PgDn  Scroll logs",
                "  f / End    Toggle / resume follow",
                "",
                "Actions:",
                "  s          Start selected",
                "  x          Stop selected",
                "  r          Restart selected",
                "  c          Clear selected logs",
                "",
                "General:",
                "  ?          Toggle this help",
                "  q          Quit (stops all servers)",
            ]
            .join("\n");
            let help_block = Paragraph::new(help_text)
                .block(
                    Block::default()
                        .title("Help")
                        .borders(Borders::ALL)
                        .border_type(BorderType::Rounded),
                )
                .style(Style::default().bg(Color::DarkGray).fg(Color::White));
            frame.render_widget(Clear, popup_area);
            frame.render_widget(help_block, popup_area);
        }
    })?;
    Ok(())
}

fn server_item(server: &StatusReport, selected: bool) -> ListItem<'static> {
    let (glyph, glyph_style) = status_glyph(server);
    let name_style = if selected {
        color_style(&server.color).add_modifier(Modifier::BOLD)
    } else {
        color_style(&server.color)
    };
    let marker = if selected { "▶ " } else { "  " };
    let mut lines = vec![Line::from(vec![
        Span::styled(marker, Style::default().fg(Color::Cyan)),
        Span::styled(format!("{} ", glyph), glyph_style),
        Span::styled(server.name.clone(), name_style),
        Span::styled(format!(" :{}", server.port), Style::default().fg(Color::DarkGray)),
    ])];
    if let Some(error) = &server.error {
        lines.push(Line::from(vec![
            Span::raw("    "),
            Span::styled(error.clone(), Style::default().fg(Color::Red)),
        ]));
    }
    ListItem::new(Text::from(lines))
}

fn status_glyph(server: &StatusReport) -> (char, Style) {
    match server.status {
        ServerState::Running => ('●', Style::default().fg(Color::Green)),
        ServerState::External => ('◆', Style::default().fg(Color::Yellow)),
        ServerState::Stopped if server.error.is_some() => ('✖', Style::default().fg(Color::Red)),
        ServerState::Stopped => ('○', Style::default().fg(Color::DarkGray)),
    }
}

fn log_title(server: Option<&StatusReport>, ring: Option<&LogRing>) -> String {
    let Some(server) = server else {
        return "Logs".to_string();
    };
    let state = match server.status {
        ServerState::Running => "running",
        ServerState::External => "external",
        ServerState::Stopped => "stopped",
    };
    match ring {
        Some(ring) => format!(
            "Logs - {} ({}) {}/{}",
            server.name,
            state,
            ring.len(),
            ring.capacity()
        ),
        None => format!("Logs - {} ({})", server.name, state),
    }
}

/// Reads the visible window of the selected ring, oldest line at the top.
fn render_log_lines(app: &mut App, ring: &LogRing, width: usize) -> (Text<'static>, usize) {
    let height = app.log_view_height;
    let total = ring.len();
    app.clamp_scroll(total);
    if height == 0 || ring.is_empty() {
        return (Text::default(), total);
    }
    let page = ring.range(app.scroll as i64, height, true);
    let lines = page
        .lines
        .iter()
        .rev()
        .map(|line| {
            let plain = strip_carriage(&sanitize_text(line, true));
            Line::from(Span::raw(truncate(&plain, width.saturating_sub(1))))
        })
        .collect::<Vec<_>>();
    (Text::from(lines), total)
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn list_state(selected: usize, len: usize) -> ListState {
    let mut state = ListState::default();
    if len > 0 {
        state.select(Some(selected.min(len - 1)));
    }
    state
}

fn color_style(name: &str) -> Style {
    Style::default().fg(color_from_name(name).unwrap_or(Color::White))
}

fn color_from_name(name: &str) -> Option<Color> {
    match name.to_lowercase().as_str() {
        "black" => Some(Color::Black),
        "red" => Some(Color::Red),
        "green" => Some(Color::Green),
        "yellow" => Some(Color::Yellow),
        "blue" => Some(Color::Blue),
        "magenta" => Some(Color::Magenta),
        "cyan" => Some(Color::Cyan),
        "gray" | "grey" => Some(Color::Gray),
        "white" => Some(Color::White),
        "bright_red" => Some(Color::LightRed),
        "bright_green" => Some(Color::LightGreen),
        "bright_yellow" => Some(Color::LightYellow),
        "bright_blue" => Some(Color::LightBlue),
        "bright_magenta" => Some(Color::LightMagenta),
        "bright_cyan" => Some(Color::LightCyan),
        _ => None,
    }
}

fn truncate(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}

fn strip_carriage(text: &str) -> String {
    text.rsplit('\r').next().unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn palette_names_resolve() {
        for name in crate::manager::COLORS {
            assert!(color_from_name(name).is_some(), "{name} has no color");
        }
        assert_eq!(color_from_name("BRIGHT_CYAN"), Some(Color::LightCyan));
        assert_eq!(color_from_name("plaid"), None);
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 6), "héllo~");
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("anything", 0), "");
    }

    #[test]
    fn carriage_returns_keep_last_segment() {
        assert_eq!(strip_carriage("10%\r50%\r100%"), "100%");
        assert_eq!(strip_carriage("plain"), "plain");
    }
}
