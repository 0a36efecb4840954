//! Console stream over one SSH session channel.
//!
//! A drain task empties the russh [`Channel`] queue into an unbounded
//! per-channel queue as soon as messages arrive, so the connection's session
//! loop never blocks on a full channel buffer while a command is running.
//! Output goes back through the connection [`Handle`]. SSH clients with a
//! pty send keystrokes, so input runs through the shared [`LineEditor`].

use async_trait::async_trait;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use tokio::sync::mpsc;

use crate::console::error::ConsoleError;
use crate::console::stream::{
    ConsoleReader, ConsoleWriter, EditEvent, LineEditor, ReadMode, StreamCapabilities,
};

/// Inbound channel event forwarded by the drain task.
#[derive(Debug)]
pub(crate) enum ChannelInput {
    Data(Vec<u8>),
    Eof,
}

/// Forward channel data until the channel ends or the reader is dropped.
async fn drain(mut channel: Channel<Msg>, input: mpsc::UnboundedSender<ChannelInput>) {
    loop {
        let forwarded = match channel.wait().await {
            Some(ChannelMsg::Data { data }) => input.send(ChannelInput::Data(data.to_vec())),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                let _ = input.send(ChannelInput::Eof);
                return;
            }
            // Window adjustments, requests and stderr data.
            Some(_) => Ok(()),
        };
        if forwarded.is_err() {
            return;
        }
    }
}

pub(crate) struct SshChannelReader {
    input: mpsc::UnboundedReceiver<ChannelInput>,
    editor: LineEditor,
    handle: Handle,
    channel: ChannelId,
}

impl SshChannelReader {
    /// Take over `channel` and spawn its drain task.
    pub(crate) fn new(channel: Channel<Msg>, handle: Handle) -> Self {
        let id = channel.id();
        let (input_tx, input) = mpsc::unbounded_channel();
        tokio::spawn(drain(channel, input_tx));
        Self {
            input,
            editor: LineEditor::new(),
            handle,
            channel: id,
        }
    }
}

#[async_trait]
impl ConsoleReader for SshChannelReader {
    async fn read_line(&mut self, mode: ReadMode) -> Result<Option<String>, ConsoleError> {
        loop {
            let mut echo = Vec::new();
            let event = self.editor.next_event(mode == ReadMode::Line, &mut echo);
            if !echo.is_empty()
                && self
                    .handle
                    .data(self.channel, CryptoVec::from_slice(&echo))
                    .await
                    .is_err()
            {
                return Ok(None);
            }
            match event {
                Some(EditEvent::Line(line)) => return Ok(Some(line)),
                Some(EditEvent::Eof) => return Ok(None),
                None => {}
            }

            match self.input.recv().await {
                Some(ChannelInput::Data(data)) => self.editor.push(&data),
                Some(ChannelInput::Eof) | None => return Ok(None),
            }
        }
    }
}

/// Writes channel data through the connection handle.
///
/// Closing is left to the adapter's channel bookkeeping, so the writer
/// reports no optional capabilities.
pub(crate) struct SshChannelWriter {
    handle: Handle,
    channel: ChannelId,
}

impl SshChannelWriter {
    pub(crate) fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

#[async_trait]
impl ConsoleWriter for SshChannelWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), ConsoleError> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| ConsoleError::Closed)
    }

    fn capabilities(&self) -> StreamCapabilities {
        StreamCapabilities::NONE
    }
}
