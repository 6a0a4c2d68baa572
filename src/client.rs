// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The caller-facing side: the transport contract, [`connect`], and the
//! [`Connection`] handle.
//!
//! One spawned task owns the whole protocol state and is driven by three
//! event sources: transport frames, handle commands, and the key-exchange
//! timeout. Everything the session emits is flushed to the transport
//! before the task waits again, so wire order always matches sequence
//! number order without any locking.

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::auth::Credentials;
use crate::negotiation::Preferred;
use crate::session::{Config, Session, SessionEvent};
use crate::{Error, KEX_TIMEOUT};

/// A message-oriented byte transport, e.g. a WebSocket carrying binary
/// frames. Inbound frames and closure are delivered separately, as
/// [`TransportEvent`]s.
pub trait Transport: Send + 'static {
    /// Send one binary frame. Only called while [`Transport::is_open`]
    /// returns true.
    fn send(&mut self, data: &[u8]) -> Result<(), Error>;
    /// Whether sends may currently proceed.
    fn is_open(&self) -> bool;
    /// Close the underlying transport.
    fn close(&mut self);
}

/// What the transport feeds into the connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// One inbound binary frame. No framing alignment is assumed.
    Data(Vec<u8>),
    /// The transport closed; `clean` distinguishes an orderly close from
    /// a dropped connection.
    Closed { clean: bool },
}

/// Connection options. The defaults give an 80x24 `xterm-256color`
/// terminal.
pub struct Options {
    pub cols: u32,
    pub rows: u32,
    pub term: String,
    /// Preference order for the negotiated algorithms.
    pub preferred: Preferred,
    /// Called once if the server denies the PTY request (the shell is
    /// still requested without it).
    pub on_pty_denied: Option<Box<dyn FnOnce() + Send>>,
    /// Called once with the raw server host-key blob, before the
    /// handshake completes. Verifying it against a known-hosts store is
    /// the caller's responsibility.
    pub on_host_key: Option<Box<dyn FnOnce(Vec<u8>) + Send>>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            cols: 80,
            rows: 24,
            term: "xterm-256color".to_string(),
            preferred: Preferred::DEFAULT,
            on_pty_denied: None,
            on_host_key: None,
        }
    }
}

enum Command {
    Write(Vec<u8>),
    Subscribe(Box<dyn FnMut(&[u8]) + Send>),
    Resize(u32, u32),
    Close,
}

/// Handle to a running connection. Cheap to clone; dropping every clone
/// closes the connection.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    /// Write bytes (or a string) to the shell. A no-op until the shell
    /// request has been sent.
    pub fn write(&self, data: impl Into<Vec<u8>>) {
        let _ = self.commands.send(Command::Write(data.into()));
    }

    /// Register the single subscriber for merged stdout/stderr bytes.
    /// Output that arrived before registration is delivered immediately.
    pub fn on_data(&self, subscriber: impl FnMut(&[u8]) + Send + 'static) {
        let _ = self.commands.send(Command::Subscribe(Box::new(subscriber)));
    }

    /// Tell the remote PTY about a new terminal size.
    pub fn resize(&self, cols: u32, rows: u32) {
        let _ = self.commands.send(Command::Resize(cols, rows));
    }

    /// Disconnect and close the transport.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Start an SSH session over `transport`, with inbound frames arriving on
/// `events`. Returns as soon as the connection task is running; the
/// handshake proceeds in the background and `on_error` fires exactly once
/// if anything fatal happens.
///
/// Must be called from within a tokio runtime.
pub fn connect<T, E>(
    transport: T,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    credentials: Credentials,
    on_error: E,
    options: Options,
) -> Connection
where
    T: Transport,
    E: FnOnce(Error) + Send + 'static,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let config = Config {
        term: options.term,
        cols: options.cols,
        rows: options.rows,
        preferred: options.preferred,
        ..Config::default()
    };
    let session = Session::new(config, credentials);

    tokio::spawn(async move {
        let result = run(
            transport,
            events,
            commands_rx,
            session,
            options.on_pty_denied,
            options.on_host_key,
        )
        .await;
        if let Err(e) = result {
            warn!("connection failed: {e}");
            on_error(e);
        }
    });

    Connection {
        commands: commands_tx,
    }
}

async fn run<T: Transport>(
    mut transport: T,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut session: Session,
    mut on_pty_denied: Option<Box<dyn FnOnce() + Send>>,
    mut on_host_key: Option<Box<dyn FnOnce(Vec<u8>) + Send>>,
) -> Result<(), Error> {
    let mut subscriber: Option<Box<dyn FnMut(&[u8]) + Send>> = None;
    // Output that arrived before the caller registered a subscriber.
    let mut backlog: Vec<Vec<u8>> = Vec::new();
    let mut kex_deadline: Option<Instant> = None;
    let mut ended = false;

    // The client identification line is queued at construction.
    flush(&mut session, &mut transport)?;

    while !ended {
        let step = async {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Close) => {
                        session.close();
                        Ok(true)
                    }
                    Some(Command::Write(data)) => {
                        session.write(&data);
                        Ok(false)
                    }
                    Some(Command::Subscribe(mut s)) => {
                        // Deliver whatever arrived before registration.
                        for data in backlog.drain(..) {
                            s(&data);
                        }
                        subscriber = Some(s);
                        Ok(false)
                    }
                    Some(Command::Resize(cols, rows)) => {
                        session.resize(cols, rows);
                        Ok(false)
                    }
                },
                event = events.recv() => match event {
                    Some(TransportEvent::Data(chunk)) => {
                        session.handle_data(&chunk).map(|()| false)
                    }
                    Some(TransportEvent::Closed { clean: true }) | None => {
                        debug!("transport closed cleanly");
                        Ok(true)
                    }
                    Some(TransportEvent::Closed { clean: false }) => {
                        Err(Error::TransportClosed)
                    }
                },
                _ = sleep_until_or_forever(kex_deadline) => {
                    Err(Error::KexTimeout)
                }
            }
        }
        .await;

        // The KEX timeout runs from sending our kex init until the
        // server's reply is handled.
        kex_deadline = match (session.kex_in_flight(), kex_deadline) {
            (true, None) => Some(Instant::now() + KEX_TIMEOUT),
            (true, deadline) => deadline,
            (false, _) => None,
        };

        for event in session.take_events() {
            match event {
                SessionEvent::Data(data) => match subscriber.as_mut() {
                    Some(subscriber) => subscriber(&data),
                    None => backlog.push(data),
                },
                SessionEvent::PtyDenied => {
                    if let Some(callback) = on_pty_denied.take() {
                        callback();
                    }
                }
                SessionEvent::HostKey(blob) => {
                    if let Some(callback) = on_host_key.take() {
                        callback(blob);
                    }
                }
                SessionEvent::Ended => ended = true,
            }
        }

        match step {
            Ok(done) => {
                flush(&mut session, &mut transport)?;
                if done {
                    break;
                }
            }
            Err(e) => {
                session.set_error();
                transport.close();
                return Err(e);
            }
        }
    }

    transport.close();
    Ok(())
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn flush<T: Transport>(session: &mut Session, transport: &mut T) -> Result<(), Error> {
    let out = session.take_output();
    if !out.is_empty() {
        if !transport.is_open() {
            return Err(Error::TransportClosed);
        }
        transport.send(&out)?;
    }
    Ok(())
}
