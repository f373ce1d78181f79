//! Clipboard access for the TUI.
//!
//! On X11/Wayland the clipboard contents are served by the owning process, so a single
//! `arboard::Clipboard` is kept alive on a background thread for the whole session.

use anyhow::Result;
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;

static CLIPBOARD_TX: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

fn clipboard_owner(rx: std_mpsc::Receiver<String>) {
    let mut clipboard: Option<arboard::Clipboard> = None;
    for text in rx {
        if clipboard.is_none() {
            clipboard = arboard::Clipboard::new().ok();
        }
        let Some(cb) = clipboard.as_mut() else {
            continue;
        };
        if cb.set_text(text).is_err() {
            // Reconnect on the next request.
            clipboard = None;
        }
    }
}

/// Queue `text` for the clipboard. Returns without waiting for the display server.
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let tx = CLIPBOARD_TX.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();
        std::thread::spawn(move || clipboard_owner(rx));
        tx
    });
    tx.send(text.to_string())
        .map_err(|_| anyhow::anyhow!("clipboard thread is gone"))
}

/// Shorten `text` to `max` chars for the status line.
pub fn status_preview(text: &str, max: usize) -> String {
    let first = text.lines().next().unwrap_or_default();
    if first.chars().count() <= max {
        return first.to_string();
    }
    let cut: String = first.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_keeps_first_line_and_truncates() {
        assert_eq!(status_preview("digraph G {\n a -> b\n}", 40), "digraph G {");
        assert_eq!(status_preview("abcdefghij", 5), "abcd…");
        assert_eq!(status_preview("", 5), "");
    }
}
