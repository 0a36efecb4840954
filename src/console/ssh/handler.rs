//! Per-connection russh handler.
//!
//! One handler serves one TCP connection. It answers authentication through
//! the adapter's [`AuthStrategy`](super::auth::AuthStrategy) and turns every
//! accepted session channel into a [`Console`]. Channel input is read by the
//! console's own reader, not through the `data` callbacks.

use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId};
use tracing::{debug, info, warn};

use super::auth::Credential;
use super::channel::{SshChannelReader, SshChannelWriter};
use super::server::SshInner;
use crate::console::error::ConsoleError;
use crate::console::session::Console;
use crate::console::stream::ConsoleIo;

pub(crate) struct SshHandler {
    inner: Arc<SshInner>,
    conn_id: String,
    peer: SocketAddr,
    user: Option<String>,
}

impl SshHandler {
    pub(crate) fn new(inner: Arc<SshInner>, conn_id: String, peer: SocketAddr) -> Self {
        Self {
            inner,
            conn_id,
            peer,
            user: None,
        }
    }

    async fn check(&mut self, user: &str, credential: Credential<'_>) -> Auth {
        let method = credential.method();
        match self.inner.auth.authenticate(user, credential).await {
            Ok(true) => {
                info!(conn_id = %self.conn_id, peer = %self.peer, user, method, "SSH auth success");
                self.user = Some(user.to_string());
                Auth::Accept
            }
            Ok(false) => {
                warn!(conn_id = %self.conn_id, peer = %self.peer, user, method, "SSH auth rejected");
                reject()
            }
            Err(e) => {
                warn!(conn_id = %self.conn_id, peer = %self.peer, user, method, error = %e, "SSH auth rejected");
                reject()
            }
        }
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

impl russh::server::Handler for SshHandler {
    type Error = ConsoleError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(self.check(user, Credential::Password(password)).await)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.check(user, Credential::PublicKey(public_key)).await)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.user.is_none() {
            return Ok(false);
        }

        let channel_id = channel.id();
        let handle = session.handle();

        let io = ConsoleIo::new(
            SshChannelReader::new(channel, handle.clone()),
            SshChannelWriter::new(handle.clone(), channel_id),
        );
        let console = Console::new(io, self.inner.defaults.options());

        if !self
            .inner
            .register_channel(&self.conn_id, channel_id, console.clone(), handle)
            .await
        {
            debug!(conn_id = %self.conn_id, "Channel refused, connection is shutting down");
            return Ok(false);
        }

        self.inner.defaults.prepare(&console);

        let inner = self.inner.clone();
        let conn_id = self.conn_id.clone();
        console.set_on_close(move || async move {
            inner.close_channel(&conn_id, channel_id).await;
        });

        info!(conn_id = %self.conn_id, console_id = %console.id(), channel = ?channel_id, "SSH channel opened");
        console.start();
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(conn_id = %self.conn_id, "exec request refused");
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(conn_id = %self.conn_id, subsystem = %name, "Subsystem refused");
        let _ = session.channel_failure(channel);
        Ok(())
    }
}
