use std::io::Write;

use thiserror::Error;
use tokio::sync::mpsc;

const SGR_RESET: &str = "\x1b[0m";
const CLEAR_LINE: &str = "\r\x1b[2K";

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("line input interrupted")]
    Interrupted,
    #[error("terminal input closed")]
    Closed,
    #[error("terminal write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyInput {
    Char(char),
    Backspace,
    Enter,
    Interrupt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStyle {
    Normal,
    Error,
    Muted,
    Assistant,
}

impl OutputStyle {
    fn sgr(self) -> Option<&'static str> {
        match self {
            OutputStyle::Normal => None,
            OutputStyle::Error => Some("\x1b[31m"),
            OutputStyle::Muted => Some("\x1b[90m"),
            OutputStyle::Assistant => Some("\x1b[32m"),
        }
    }

    /// Wrap `text` in this style's escape codes.
    pub fn paint(self, text: &str) -> String {
        match self.sgr() {
            Some(code) if !text.is_empty() => format!("{code}{text}{SGR_RESET}"),
            _ => text.to_string(),
        }
    }
}

/// Outcome of feeding one key to a [`LineBuffer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineEdit {
    Inserted(char),
    Erased,
    Submitted(String),
    Interrupted,
    Ignored,
}

/// One line of pending user input.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    chars: Vec<char>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, key: KeyInput) -> LineEdit {
        match key {
            KeyInput::Char(ch) if ch.is_control() => LineEdit::Ignored,
            KeyInput::Char(ch) => {
                self.chars.push(ch);
                LineEdit::Inserted(ch)
            }
            KeyInput::Backspace => match self.chars.pop() {
                Some(_) => LineEdit::Erased,
                None => LineEdit::Ignored,
            },
            KeyInput::Enter => LineEdit::Submitted(self.chars.drain(..).collect()),
            KeyInput::Interrupt => {
                self.chars.clear();
                LineEdit::Interrupted
            }
        }
    }

    pub fn as_string(&self) -> String {
        self.chars.iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn clear(&mut self) {
        self.chars.clear();
    }
}

/// Renders styled output and line input onto a byte sink.
///
/// `echo` controls whether keystrokes are written back; a cooked OS tty
/// already echoes, a raw one or a browser surface does not.
#[derive(Debug)]
pub struct Terminal<W> {
    out: W,
    line: LineBuffer,
    colors: bool,
    echo: bool,
    status_visible: bool,
}

impl<W: Write> Terminal<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            line: LineBuffer::new(),
            colors: true,
            echo: true,
            status_visible: false,
        }
    }

    /// No colour codes; handy when the sink is a file or a test buffer.
    pub fn plain(out: W) -> Self {
        Self {
            colors: false,
            ..Self::new(out)
        }
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn write(&mut self, text: &str, style: OutputStyle) -> std::io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.clear_status()?;
        if self.colors {
            self.out.write_all(style.paint(text).as_bytes())?;
        } else {
            self.out.write_all(text.as_bytes())?;
        }
        self.out.flush()
    }

    /// Show a transient status line, replacing the previous one.
    pub fn status(&mut self, text: &str) -> std::io::Result<()> {
        self.out.write_all(CLEAR_LINE.as_bytes())?;
        let text = if self.colors {
            OutputStyle::Muted.paint(text)
        } else {
            text.to_string()
        };
        self.out.write_all(text.as_bytes())?;
        self.status_visible = true;
        self.out.flush()
    }

    pub fn clear_status(&mut self) -> std::io::Result<()> {
        if !self.status_visible {
            return Ok(());
        }
        self.status_visible = false;
        self.out.write_all(CLEAR_LINE.as_bytes())?;
        self.out.flush()
    }

    /// Start a fresh line of input behind `prompt`.
    pub fn prompt(&mut self, prompt: &str) -> std::io::Result<()> {
        self.line.clear();
        self.write(prompt, OutputStyle::Normal)?;
        self.out.flush()
    }

    /// Apply one key to the current input line, echoing it when enabled.
    /// Returns the finished line on `Enter`.
    pub fn key(&mut self, key: KeyInput) -> Result<Option<String>, TerminalError> {
        match self.line.apply(key) {
            LineEdit::Inserted(ch) => {
                if self.echo {
                    let mut buf = [0u8; 4];
                    self.out.write_all(ch.encode_utf8(&mut buf).as_bytes())?;
                }
            }
            LineEdit::Erased => {
                if self.echo {
                    self.out.write_all(b"\x08 \x08")?;
                }
            }
            LineEdit::Submitted(line) => {
                if self.echo {
                    self.out.write_all(b"\n")?;
                }
                self.out.flush()?;
                return Ok(Some(line));
            }
            LineEdit::Interrupted => {
                if self.echo {
                    self.out.write_all(b"^C\n")?;
                }
                self.out.flush()?;
                return Err(TerminalError::Interrupted);
            }
            LineEdit::Ignored => {}
        }
        self.out.flush()?;
        Ok(None)
    }

    /// Prompt and collect one line from `keys`.
    pub async fn read_line(
        &mut self,
        keys: &mut mpsc::UnboundedReceiver<KeyInput>,
        prompt: &str,
    ) -> Result<String, TerminalError> {
        self.prompt(prompt)?;
        while let Some(key) = keys.recv().await {
            if let Some(line) = self.key(key)? {
                return Ok(line);
            }
        }
        Err(TerminalError::Closed)
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Incremental decoder from raw input bytes to key events. Holds back a
/// UTF-8 sequence split across reads and folds `\r\n` into one `Enter`.
#[derive(Debug, Default)]
pub struct KeyDecoder {
    pending: Vec<u8>,
    after_cr: bool,
}

impl KeyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<KeyInput> {
        self.pending.extend_from_slice(bytes);
        let mut keys = Vec::new();
        let mut rest: &[u8] = &[];
        let text = match std::str::from_utf8(&self.pending) {
            Ok(text) => text.to_string(),
            Err(err) => {
                let valid = err.valid_up_to();
                let mut text = String::from_utf8_lossy(&self.pending[..valid]).to_string();
                match err.error_len() {
                    // Truncated sequence: keep it for the next read.
                    None => rest = &self.pending[valid..],
                    Some(bad) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        text.push_str(&String::from_utf8_lossy(&self.pending[valid + bad..]));
                    }
                }
                text
            }
        };
        let rest = rest.to_vec();

        for ch in text.chars() {
            let after_cr = std::mem::take(&mut self.after_cr);
            match ch {
                '\r' => {
                    keys.push(KeyInput::Enter);
                    self.after_cr = true;
                }
                '\n' if after_cr => {}
                '\n' => keys.push(KeyInput::Enter),
                '\x7f' | '\x08' => keys.push(KeyInput::Backspace),
                '\x03' => keys.push(KeyInput::Interrupt),
                ch if ch.is_control() => {}
                ch => keys.push(KeyInput::Char(ch)),
            }
        }
        self.pending = rest;
        keys
    }
}

/// Decode one complete chunk of input bytes.
pub fn keys_from_bytes(bytes: &[u8]) -> Vec<KeyInput> {
    KeyDecoder::new().feed(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_edits_and_submits() {
        let mut line = LineBuffer::new();
        for key in [
            KeyInput::Char('A'),
            KeyInput::Char('x'),
            KeyInput::Backspace,
            KeyInput::Char('d'),
            KeyInput::Char('a'),
        ] {
            line.apply(key);
        }
        assert_eq!(line.as_string(), "Ada");
        assert_eq!(line.apply(KeyInput::Enter), LineEdit::Submitted("Ada".to_string()));
        assert!(line.is_empty());
        assert_eq!(line.apply(KeyInput::Backspace), LineEdit::Ignored);
    }

    #[test]
    fn styles_wrap_text_in_sgr_codes() {
        let mut terminal = Terminal::new(Vec::new());
        terminal.write("ok\n", OutputStyle::Normal).expect("write");
        terminal.write("bad\n", OutputStyle::Error).expect("write");
        let out = String::from_utf8(terminal.into_inner()).expect("utf8");
        assert_eq!(out, "ok\n\x1b[31mbad\n\x1b[0m");
    }

    #[test]
    fn status_line_is_cleared_before_output() {
        let mut terminal = Terminal::plain(Vec::new());
        terminal.status("Loading.").expect("status");
        terminal.write("hi\n", OutputStyle::Normal).expect("write");
        let out = String::from_utf8(terminal.into_inner()).expect("utf8");
        assert_eq!(out, "\r\x1b[2KLoading.\r\x1b[2Khi\n");
    }

    #[tokio::test]
    async fn read_line_echoes_keys() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for key in keys_from_bytes(b"Adx\x7fa\r\n") {
            tx.send(key).expect("send");
        }
        let mut terminal = Terminal::plain(Vec::new());
        let line = terminal.read_line(&mut rx, "Name? ").await.expect("line");
        assert_eq!(line, "Ada");
        let out = String::from_utf8(terminal.into_inner()).expect("utf8");
        assert_eq!(out, "Name? Adx\x08 \x08a\n");
    }

    #[tokio::test]
    async fn read_line_reports_closed_input() {
        let (tx, mut rx) = mpsc::unbounded_channel::<KeyInput>();
        drop(tx);
        let mut terminal = Terminal::plain(Vec::new());
        let err = terminal.read_line(&mut rx, "> ").await.unwrap_err();
        assert!(matches!(err, TerminalError::Closed));
    }

    #[test]
    fn decoder_handles_split_utf8_and_crlf() {
        let mut decoder = KeyDecoder::new();
        let bytes = "é\r\n".as_bytes();
        assert!(decoder.feed(&bytes[..1]).is_empty());
        assert_eq!(
            decoder.feed(&bytes[1..]),
            vec![KeyInput::Char('é'), KeyInput::Enter]
        );
        assert_eq!(
            keys_from_bytes(b"\x03\n\n"),
            vec![KeyInput::Interrupt, KeyInput::Enter, KeyInput::Enter]
        );
    }
}
