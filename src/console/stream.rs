//! The abstract duplex stream a [`Console`](super::session::Console) is bound to.
//!
//! Every transport adapter hands a console two halves:
//!
//! - a [`ConsoleReader`] yielding one line at a time (blocking until a line,
//!   end-of-stream or an error is available), and
//! - a [`ConsoleWriter`] accepting raw bytes, with optional flush and close
//!   capabilities advertised once through [`StreamCapabilities`].
//!
//! [`LineReader`] and [`StreamWriter`] cover byte-stream transports where
//! the peer sends whole `\n` terminated lines (Telnet, pipes, tests).
//! Peers typing character-at-a-time (SSH ptys) go through `LineEditor`,
//! which does minimal line editing and echoes input except while a password
//! is being read.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use super::error::ConsoleError;

/// Longest input line accepted, in bytes, without its terminator.
pub const MAX_LINE_LEN: usize = 4096;

/// How the next line is going to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Regular command input, echoed when the reader echoes.
    Line,
    /// Secret input, never echoed.
    Password,
}

/// Optional writer capabilities, resolved once when the stream is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCapabilities {
    pub flush: bool,
    pub close: bool,
}

impl StreamCapabilities {
    pub const NONE: Self = Self {
        flush: false,
        close: false,
    };

    pub const ALL: Self = Self {
        flush: true,
        close: true,
    };
}

/// Line-oriented input half of a console stream.
#[async_trait]
pub trait ConsoleReader: Send {
    /// Read the next line without its terminator.
    ///
    /// Returns `Ok(None)` on clean end-of-stream.
    async fn read_line(&mut self, mode: ReadMode) -> Result<Option<String>, ConsoleError>;
}

/// Output half of a console stream.
#[async_trait]
pub trait ConsoleWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), ConsoleError>;

    fn capabilities(&self) -> StreamCapabilities;

    /// Only called when [`StreamCapabilities::flush`] is set.
    async fn flush(&mut self) -> Result<(), ConsoleError> {
        Ok(())
    }

    /// Only called when [`StreamCapabilities::close`] is set.
    async fn close(&mut self) -> Result<(), ConsoleError> {
        Ok(())
    }
}

/// Both halves of a console stream, as handed to a console at creation.
pub struct ConsoleIo {
    pub(crate) reader: Box<dyn ConsoleReader>,
    pub(crate) writer: Box<dyn ConsoleWriter>,
}

impl ConsoleIo {
    pub fn new(reader: impl ConsoleReader + 'static, writer: impl ConsoleWriter + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Bind a console to any duplex byte stream carrying whole lines.
    pub fn from_stream<S>(stream: S, capabilities: StreamCapabilities) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::new(
            LineReader::new(read_half),
            StreamWriter::new(write_half, capabilities),
        )
    }
}

/// Strip one trailing `\n` and any `\r` preceding it.
fn trim_line_end(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    while line.last() == Some(&b'\r') {
        line.pop();
    }
}

/// Reader for peers that send complete `\n` terminated lines.
///
/// A line longer than [`MAX_LINE_LEN`] is a read error.
pub struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin + Send> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ConsoleReader for LineReader<R> {
    async fn read_line(&mut self, _mode: ReadMode) -> Result<Option<String>, ConsoleError> {
        let mut line = Vec::new();
        // Room for the terminator on a maximal line.
        let limit = MAX_LINE_LEN as u64 + 2;
        let n = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        trim_line_end(&mut line);
        if line.len() > MAX_LINE_LEN {
            let err = std::io::Error::new(std::io::ErrorKind::InvalidData, "input line too long");
            return Err(err.into());
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

/// Writer over any `AsyncWrite`, advertising the given capabilities.
pub struct StreamWriter<W> {
    inner: W,
    capabilities: StreamCapabilities,
}

impl<W: AsyncWrite + Unpin + Send> StreamWriter<W> {
    pub fn new(inner: W, capabilities: StreamCapabilities) -> Self {
        Self {
            inner,
            capabilities,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ConsoleWriter for StreamWriter<W> {
    async fn write(&mut self, data: &[u8]) -> Result<(), ConsoleError> {
        self.inner.write_all(data).await?;
        Ok(())
    }

    fn capabilities(&self) -> StreamCapabilities {
        self.capabilities
    }

    async fn flush(&mut self) -> Result<(), ConsoleError> {
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConsoleError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Outcome of feeding bytes to a [`LineEditor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EditEvent {
    Line(String),
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscapeState {
    None,
    Escape,
    Csi,
}

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;

/// Minimal terminal line discipline.
///
/// `\r`, `\n` and `\r\n` all end a line. Backspace/DEL erase the last
/// character, Ctrl-C discards the line, Ctrl-D on an empty line is
/// end-of-stream, ANSI escape sequences (arrow keys) are swallowed.
/// Characters past [`MAX_LINE_LEN`] are dropped.
#[derive(Debug)]
pub(crate) struct LineEditor {
    pending: VecDeque<u8>,
    line: Vec<u8>,
    skip_lf: bool,
    escape: EscapeState,
}

impl LineEditor {
    pub(crate) fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            line: Vec::new(),
            skip_lf: false,
            escape: EscapeState::None,
        }
    }

    pub(crate) fn push(&mut self, data: &[u8]) {
        self.pending.extend(data);
    }

    /// Consume pending bytes until a line or end-of-stream is complete.
    ///
    /// Bytes to echo back to the peer are appended to `echo_out`.
    pub(crate) fn next_event(&mut self, echo: bool, echo_out: &mut Vec<u8>) -> Option<EditEvent> {
        while let Some(byte) = self.pending.pop_front() {
            let skip_lf = std::mem::replace(&mut self.skip_lf, false);

            match self.escape {
                EscapeState::Escape => {
                    self.escape = if byte == b'[' {
                        EscapeState::Csi
                    } else {
                        EscapeState::None
                    };
                    continue;
                }
                EscapeState::Csi => {
                    if (0x40..=0x7e).contains(&byte) {
                        self.escape = EscapeState::None;
                    }
                    continue;
                }
                EscapeState::None => {}
            }

            match byte {
                b'\n' if skip_lf => {}
                b'\r' | b'\n' => {
                    self.skip_lf = byte == b'\r';
                    echo_out.extend_from_slice(b"\r\n");
                    let line = std::mem::take(&mut self.line);
                    return Some(EditEvent::Line(String::from_utf8_lossy(&line).into_owned()));
                }
                BACKSPACE | DEL => {
                    if self.pop_char() && echo {
                        echo_out.extend_from_slice(b"\x08 \x08");
                    }
                }
                CTRL_C => {
                    self.line.clear();
                    echo_out.extend_from_slice(b"^C\r\n");
                    return Some(EditEvent::Line(String::new()));
                }
                CTRL_D if self.line.is_empty() => return Some(EditEvent::Eof),
                ESC => self.escape = EscapeState::Escape,
                _ if self.line.len() >= MAX_LINE_LEN => {}
                b'\t' => {
                    self.line.push(byte);
                    if echo {
                        echo_out.push(byte);
                    }
                }
                _ if byte < 0x20 => {}
                _ => {
                    self.line.push(byte);
                    if echo {
                        echo_out.push(byte);
                    }
                }
            }
        }
        None
    }

    /// Remove the last (possibly multi-byte) character.
    fn pop_char(&mut self) -> bool {
        let mut removed = false;
        while let Some(byte) = self.line.pop() {
            removed = true;
            if byte & 0xc0 != 0x80 {
                break;
            }
        }
        removed
    }
}
