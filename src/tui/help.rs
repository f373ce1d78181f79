use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &str, pad: usize, what: &str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(key.to_string(), Style::default().fg(Color::Magenta)),
        Span::raw(format!("{}{what}", " ".repeat(pad.saturating_sub(key.chars().count())))),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        key_line("q / Ctrl-C", 14, "Quit"),
        key_line("i", 14, "Edit repository URL (Enter submits, Esc leaves)"),
        key_line("r", 14, "Resubmit last repository"),
        key_line("c", 14, "Cancel the running job"),
        key_line("s", 14, "Export SVG"),
        key_line("p", 14, "Export PNG"),
        key_line("y", 14, "Copy graph description (DOT) to clipboard"),
        key_line("↑/↓ j/k", 14, "Scroll preview"),
        key_line("tab", 14, "Switch tabs"),
        key_line("?", 14, "Show this help"),
        Line::from(""),
        Line::from("History tab:"),
        key_line("↑/↓ j/k", 14, "Navigate"),
        key_line("Enter", 14, "Resubmit selected repository"),
        key_line("d", 14, "Delete selected"),
        Line::from(""),
        Line::from("Starting a new run cancels the one in progress."),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
