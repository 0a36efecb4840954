//! Standard-stream adapter: the process's own terminal as one console.
//!
//! The terminal is switched to raw mode while the session runs, so input is
//! edited and echoed by the console itself. Ctrl-C arrives as data in raw
//! mode and ends the session; the terminal is restored when the session
//! closes or [`StdioConsole::stop`] is called.

use std::io::IsTerminal;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::error::ConsoleError;
use super::session::{Console, ConsoleOptions};
use super::stream::{
    ConsoleIo, ConsoleReader, EditEvent, LineEditor, ReadMode, StreamCapabilities, StreamWriter,
};

const INTERRUPT: u8 = 0x03;

/// Raw terminal mode, left again on drop.
struct RawMode;

impl RawMode {
    fn enable() -> std::io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

fn restore(raw: &Mutex<Option<RawMode>>) {
    if let Ok(mut raw) = raw.lock() {
        if raw.take().is_some() {
            debug!("Terminal mode restored");
        }
    }
}

/// Reads keystrokes from a raw terminal and echoes them back.
pub(crate) struct TerminalReader<R, W> {
    input: R,
    echo: W,
    editor: LineEditor,
}

impl<R, W> TerminalReader<R, W> {
    pub(crate) fn new(input: R, echo: W) -> Self {
        Self {
            input,
            echo,
            editor: LineEditor::new(),
        }
    }
}

impl<R, W: AsyncWrite + Unpin + Send> TerminalReader<R, W> {
    async fn echo(&mut self, data: &[u8]) -> Result<(), ConsoleError> {
        self.echo.write_all(data).await?;
        self.echo.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<R, W> ConsoleReader for TerminalReader<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_line(&mut self, mode: ReadMode) -> Result<Option<String>, ConsoleError> {
        let mut buf = [0u8; 256];
        loop {
            let mut echo = Vec::new();
            let event = self.editor.next_event(mode == ReadMode::Line, &mut echo);
            if !echo.is_empty() {
                self.echo(&echo).await?;
            }
            match event {
                Some(EditEvent::Line(line)) => return Ok(Some(line)),
                Some(EditEvent::Eof) => return Ok(None),
                None => {}
            }

            let n = self.input.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            let chunk = &buf[..n];
            if chunk.contains(&INTERRUPT) {
                self.echo(b"^C\r\n").await?;
                return Ok(None);
            }
            self.editor.push(chunk);
        }
    }
}

pub struct StdioConsole {
    console: Console,
    raw: Arc<Mutex<Option<RawMode>>>,
}

impl StdioConsole {
    pub fn new() -> Self {
        Self::with_options(ConsoleOptions::new())
    }

    pub fn with_options(options: ConsoleOptions) -> Self {
        let io = ConsoleIo::new(
            TerminalReader::new(tokio::io::stdin(), tokio::io::stdout()),
            StreamWriter::new(
                tokio::io::stdout(),
                StreamCapabilities {
                    flush: true,
                    close: false,
                },
            ),
        );
        Self {
            console: Console::new(io, options),
            raw: Arc::new(Mutex::new(None)),
        }
    }

    /// The underlying session, for command registration and login setup.
    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Switch the terminal to raw mode and start the session.
    ///
    /// Refused unless stdin and stdout are terminals.
    pub fn start(&self) -> bool {
        if !std::io::stdin().is_terminal() || !std::io::stdout().is_terminal() {
            warn!("Standard streams are not a terminal");
            return false;
        }
        let guard = match RawMode::enable() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "Failed to switch terminal to raw mode");
                return false;
            }
        };
        if let Ok(mut raw) = self.raw.lock() {
            *raw = Some(guard);
        }

        if !self.console.start() {
            restore(&self.raw);
            return false;
        }

        let console = self.console.clone();
        let raw = self.raw.clone();
        tokio::spawn(async move {
            console.closed().await;
            restore(&raw);
        });
        true
    }

    /// Close the session and restore the terminal.
    pub async fn stop(&self) {
        self.console.stop().await;
        restore(&self.raw);
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.console.closed().await;
    }
}

impl Default for StdioConsole {
    fn default() -> Self {
        Self::new()
    }
}
