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

//! The connection state machine. Inbound byte chunks go in, wire bytes
//! and session events come out; the driving loop in [`crate::client`]
//! owns one `Session` and runs it single-threaded, which is what keeps
//! sequence numbers and keystream positions matched to wire order.

use std::collections::VecDeque;

use log::{debug, trace, warn};

use crate::auth::{Auth, Credentials};
use crate::channel::{Channel, ChannelPhase};
use crate::cipher::{CipherPair, OpeningKey, SealingKey};
use crate::kex::{self, Exchange, KexAlgorithm};
use crate::negotiation::{self, Names, Preferred};
use crate::wire::{self, Encoding, Reader};
use crate::{msg, Error};

/// Cap on bytes we buffer while hunting for the server's version line.
const IDENT_BUF_LIMIT: usize = 65536;

/// SSH_DISCONNECT_BY_APPLICATION, sent on a caller-initiated close.
const DISCONNECT_BY_APPLICATION: u32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Phase {
    IdentExchange,
    Kex,
    Auth,
    ChannelOpen,
    Active,
    Closed,
    Error,
}

/// What the session wants the boundary layer to surface to the caller.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    /// Shell output (stdout and stderr merged).
    Data(Vec<u8>),
    /// The server refused the PTY; the shell was still requested.
    PtyDenied,
    /// The raw server host-key blob, for out-of-band verification.
    HostKey(Vec<u8>),
    /// The server ended the session cleanly.
    Ended,
}

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub ident: String,
    pub preferred: Preferred,
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ident: format!("SSH-2.0-{}_{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            preferred: Preferred::DEFAULT,
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

#[derive(Debug)]
enum KexState {
    Idle,
    /// KEXINIT answered, our init sent, ephemeral secret in hand.
    Exchanging {
        names: Names,
        algorithm: KexAlgorithm,
    },
    Done,
}

pub(crate) struct Session {
    phase: Phase,
    config: Config,
    credentials: Credentials,

    ident_buf: Vec<u8>,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,

    exchange: Exchange,
    kex: KexState,
    ignore_next_kex_packet: bool,
    session_id: Option<[u8; 32]>,

    seal: Option<SealingKey>,
    open: Option<OpeningKey>,
    /// Inbound key installed only once the server's NEWKEYS arrives.
    pending_open: Option<OpeningKey>,

    auth: Auth,
    channel: Channel,

    events: VecDeque<SessionEvent>,
}

impl Session {
    pub fn new(config: Config, credentials: Credentials) -> Self {
        let mut session = Session {
            phase: Phase::IdentExchange,
            exchange: Exchange {
                client_id: config.ident.as_bytes().to_vec(),
                ..Exchange::default()
            },
            config,
            credentials,
            ident_buf: Vec::new(),
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            kex: KexState::Idle,
            ignore_next_kex_packet: false,
            session_id: None,
            seal: None,
            open: None,
            pending_open: None,
            auth: Auth::new(),
            channel: Channel::new(),
            events: VecDeque::new(),
        };
        // The identification line goes out raw, before any packet.
        session.write_buf.extend_from_slice(session.config.ident.as_bytes());
        session.write_buf.extend_from_slice(b"\r\n");
        session
    }

    /// Wire bytes ready for the transport.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.write_buf)
    }

    pub fn take_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    pub fn kex_in_flight(&self) -> bool {
        matches!(self.kex, KexState::Exchanging { .. })
    }

    pub fn is_dead(&self) -> bool {
        self.phase >= Phase::Closed
    }

    fn advance(&mut self, phase: Phase) {
        // Phases only ever move forward.
        debug_assert!(phase >= self.phase, "{:?} -> {phase:?}", self.phase);
        if phase > self.phase {
            trace!("phase {:?} -> {phase:?}", self.phase);
            self.phase = phase;
        }
    }

    /// Record a fatal condition. Subsequent inbound bytes are discarded.
    pub fn set_error(&mut self) {
        self.phase = Phase::Error;
    }

    /// Feed one inbound chunk from the transport.
    pub fn handle_data(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if self.is_dead() {
            trace!("discarding {} bytes after close", chunk.len());
            return Ok(());
        }
        if self.exchange.server_id.is_empty() {
            self.ident_buf.extend_from_slice(chunk);
            if self.ident_buf.len() > IDENT_BUF_LIMIT {
                return Err(Error::Version);
            }
            if !self.extract_server_ident() {
                return Ok(());
            }
        } else {
            self.read_buf.extend_from_slice(chunk);
        }
        self.drain_packets()
    }

    /// Hunt for `SSH-...\n` in the pre-version buffer. Everything past
    /// the line terminator is protocol data.
    fn extract_server_ident(&mut self) -> bool {
        let Some(start) = self
            .ident_buf
            .windows(4)
            .position(|w| w == b"SSH-")
        else {
            return false;
        };
        let Some(eol) = self
            .ident_buf
            .get(start..)
            .and_then(|rest| rest.iter().position(|&b| b == b'\n'))
        else {
            return false;
        };
        let mut line = self.ident_buf.get(start..start + eol).unwrap_or(&[]);
        if line.last() == Some(&b'\r') {
            line = line.get(..line.len() - 1).unwrap_or(&[]);
        }
        self.exchange.server_id = line.to_vec();
        debug!(
            "server version: {:?}",
            String::from_utf8_lossy(&self.exchange.server_id)
        );
        let residual = self.ident_buf.get(start + eol + 1..).unwrap_or(&[]).to_vec();
        self.read_buf.extend_from_slice(&residual);
        self.ident_buf.clear();
        self.advance(Phase::Kex);
        true
    }

    /// Decode as many complete packets as the buffer holds.
    fn drain_packets(&mut self) -> Result<(), Error> {
        loop {
            if self.is_dead() {
                return Ok(());
            }
            let packet = match self.open.as_mut() {
                Some(open) => open.open(&self.read_buf)?,
                None => wire::parse_packet(&self.read_buf)?,
            };
            let Some(packet) = packet else {
                return Ok(());
            };
            self.read_buf.drain(..packet.consumed);
            self.handle_payload(&packet.payload)?;
        }
    }

    fn send_payload(&mut self, payload: &[u8]) {
        match self.seal.as_mut() {
            Some(seal) => {
                let wire = seal.seal(payload);
                self.write_buf.extend_from_slice(&wire);
            }
            None => {
                let wire = wire::build_packet(payload, false);
                self.write_buf.extend_from_slice(&wire);
            }
        }
    }

    fn handle_payload(&mut self, payload: &[u8]) -> Result<(), Error> {
        let Some(&msg_type) = payload.first() else {
            return Err(Error::Inconsistent);
        };
        trace!("inbound message type {msg_type}");
        match msg_type {
            msg::DISCONNECT => {
                let mut r = Reader::payload(payload);
                let reason = r.read_u32()?;
                let description = String::from_utf8_lossy(r.read_string()?).into_owned();
                Err(Error::Disconnect {
                    reason,
                    description,
                })
            }
            msg::IGNORE | msg::DEBUG | msg::EXT_INFO => Ok(()),
            msg::UNIMPLEMENTED => {
                let rejected = Reader::payload(payload).read_u32().unwrap_or(0);
                warn!("server rejected our packet at sequence number {rejected}");
                Ok(())
            }
            msg::KEXINIT => self.server_kexinit(payload),
            msg::KEX_ECDH_REPLY => self.kex_reply(payload),
            msg::NEWKEYS => self.newkeys(),
            msg::SERVICE_ACCEPT => self.service_accept(),
            msg::USERAUTH_BANNER => {
                let banner = Reader::payload(payload)
                    .read_string()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                debug!("auth banner: {banner}");
                Ok(())
            }
            msg::USERAUTH_PK_OK => {
                // The server treated our signed request as a key query;
                // sign again and present it a second time.
                self.auth.pk_ok();
                let session_id = self.session_id.ok_or(Error::Inconsistent)?;
                let request = self.credentials.request_payload(&session_id)?;
                self.send_payload(&request);
                Ok(())
            }
            msg::USERAUTH_FAILURE => Err(self.auth.failure(payload)),
            msg::USERAUTH_SUCCESS => {
                debug!("authenticated");
                self.auth.success();
                self.advance(Phase::ChannelOpen);
                let open = self.channel.open_payload();
                self.send_payload(&open);
                Ok(())
            }
            msg::GLOBAL_REQUEST => self.global_request(payload),
            msg::CHANNEL_OPEN_CONFIRMATION => {
                self.channel.confirm(payload)?;
                let term = self.config.term.clone();
                let pty = self
                    .channel
                    .pty_request_payload(&term, self.config.cols, self.config.rows);
                self.send_payload(&pty);
                Ok(())
            }
            msg::CHANNEL_OPEN_FAILURE => {
                let mut r = Reader::payload(payload);
                r.read_u32()?; // recipient
                r.read_u32()?; // reason code
                let description = String::from_utf8_lossy(r.read_string()?).into_owned();
                Err(Error::ChannelOpenFailure(description))
            }
            msg::CHANNEL_SUCCESS => self.channel_reply(true),
            msg::CHANNEL_FAILURE => self.channel_reply(false),
            msg::CHANNEL_WINDOW_ADJUST => {
                let mut r = Reader::payload(payload);
                r.read_u32()?; // recipient
                let n = r.read_u32()?;
                self.channel.credit_remote(n);
                Ok(())
            }
            msg::CHANNEL_DATA => {
                let mut r = Reader::payload(payload);
                r.read_u32()?; // recipient
                let data = r.read_string()?.to_vec();
                self.deliver(data);
                Ok(())
            }
            msg::CHANNEL_EXTENDED_DATA => {
                let mut r = Reader::payload(payload);
                r.read_u32()?; // recipient
                r.read_u32()?; // data type; stderr is merged with stdout
                let data = r.read_string()?.to_vec();
                self.deliver(data);
                Ok(())
            }
            msg::CHANNEL_EOF => {
                debug!("channel eof");
                Ok(())
            }
            msg::CHANNEL_CLOSE => {
                let close = {
                    let mut p = vec![msg::CHANNEL_CLOSE];
                    p.push_u32_be(self.channel.remote_id);
                    p
                };
                self.send_payload(&close);
                self.channel.phase = ChannelPhase::Closed;
                self.events.push_back(SessionEvent::Ended);
                self.advance(Phase::Closed);
                Ok(())
            }
            msg::CHANNEL_REQUEST => {
                let mut r = Reader::payload(payload);
                r.read_u32()?; // recipient
                let name = String::from_utf8_lossy(r.read_string()?).into_owned();
                let want_reply = r.read_byte()? != 0;
                debug!("server channel request {name:?}");
                if want_reply {
                    let mut p = vec![msg::CHANNEL_FAILURE];
                    p.push_u32_be(self.channel.remote_id);
                    self.send_payload(&p);
                }
                Ok(())
            }
            other => {
                warn!("unhandled message type {other}");
                Ok(())
            }
        }
    }

    fn server_kexinit(&mut self, payload: &[u8]) -> Result<(), Error> {
        if !matches!(self.kex, KexState::Idle) {
            // Rekeying is out of scope; a second KEXINIT is fatal.
            warn!("server attempted a key re-exchange");
            return Err(Error::Inconsistent);
        }
        let names = negotiation::read_kexinit(payload, &self.config.preferred)?;
        self.exchange.server_kexinit = payload.to_vec();
        self.ignore_next_kex_packet = names.ignore_guessed;

        let kexinit = negotiation::write_kexinit(&self.config.preferred);
        self.exchange.client_kexinit = kexinit.clone();
        self.send_payload(&kexinit);

        let algorithm = KexAlgorithm::make(names.kex)?;
        self.exchange.client_ephemeral = algorithm.client_ephemeral();
        let init = algorithm.client_init_payload();
        self.send_payload(&init);

        self.kex = KexState::Exchanging { names, algorithm };
        Ok(())
    }

    fn kex_reply(&mut self, payload: &[u8]) -> Result<(), Error> {
        if self.ignore_next_kex_packet {
            debug!("ignoring guessed kex packet");
            self.ignore_next_kex_packet = false;
            return Ok(());
        }
        let KexState::Exchanging { names, algorithm } =
            std::mem::replace(&mut self.kex, KexState::Done)
        else {
            return Err(Error::KexInit);
        };

        let mut r = Reader::payload(payload);
        let server_host_key = r.read_string()?.to_vec();
        let server_ephemeral = r.read_string()?.to_vec();
        // The host-key signature over H is deliberately not checked here:
        // trusting the host key is the caller's decision, made on the
        // blob we surface. See the crate documentation.
        let _signature = r.read_string()?;

        self.exchange.server_ephemeral = server_ephemeral.clone();
        let shared = algorithm.compute_shared_secret(&server_ephemeral)?;
        let hash = kex::compute_exchange_hash(&self.exchange, &server_host_key, &shared);

        // The session id is the first exchange hash, forever.
        let session_id = *self.session_id.get_or_insert(hash);
        let keys = kex::derive_keys(&shared, &hash, &session_id);

        self.events
            .push_back(SessionEvent::HostKey(server_host_key));

        self.send_payload(&[msg::NEWKEYS]);
        let pair = CipherPair::client(&keys, names.mac.is_etm());
        self.seal = Some(pair.seal);
        self.pending_open = Some(pair.open);
        debug!(
            "kex done: {} / {} / {}",
            names.kex.as_ref(),
            names.cipher.as_ref(),
            names.mac.as_ref()
        );
        Ok(())
    }

    fn newkeys(&mut self) -> Result<(), Error> {
        let open = self.pending_open.take().ok_or(Error::KexInit)?;
        self.open = Some(open);
        self.advance(Phase::Auth);

        let mut request = vec![msg::SERVICE_REQUEST];
        request.extend_ssh_string(b"ssh-userauth");
        self.send_payload(&request);
        self.auth.service_requested();
        Ok(())
    }

    fn service_accept(&mut self) -> Result<(), Error> {
        let session_id = self.session_id.ok_or(Error::Inconsistent)?;
        let request = self.credentials.request_payload(&session_id)?;
        self.send_payload(&request);
        self.auth.signed();
        Ok(())
    }

    fn channel_reply(&mut self, success: bool) -> Result<(), Error> {
        match self.channel.phase {
            ChannelPhase::PtyRequested => {
                if !success {
                    warn!("server denied the pty request");
                    self.events.push_back(SessionEvent::PtyDenied);
                }
                let shell = self.channel.shell_payload();
                self.send_payload(&shell);
                // The caller's write and subscriber are live from here on.
                self.advance(Phase::Active);
                Ok(())
            }
            ChannelPhase::ShellRequested => {
                if !success {
                    return Err(Error::ShellDenied);
                }
                self.channel.phase = ChannelPhase::Active;
                Ok(())
            }
            _ => {
                warn!("unexpected channel reply (success: {success})");
                Ok(())
            }
        }
    }

    fn global_request(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut r = Reader::payload(payload);
        let name = r.read_string()?.to_vec();
        let want_reply = r.read_byte()? != 0;
        debug!(
            "global request {:?}, want_reply: {want_reply}",
            String::from_utf8_lossy(&name)
        );
        if want_reply {
            if name == b"keepalive@openssh.com" {
                self.send_payload(&[msg::REQUEST_SUCCESS]);
            } else {
                self.send_payload(&[msg::REQUEST_FAILURE]);
            }
        }
        Ok(())
    }

    /// Deliver inbound channel bytes and return the window immediately.
    fn deliver(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let adjust = self.channel.window_adjust_payload(data.len() as u32);
        self.events.push_back(SessionEvent::Data(data));
        self.send_payload(&adjust);
    }

    /// Caller write: shell input.
    pub fn write(&mut self, data: &[u8]) {
        if self.is_dead() {
            return;
        }
        for payload in self.channel.data_payloads(data) {
            self.send_payload(&payload);
        }
    }

    /// Caller resize: window-change, a no-op before the channel exists.
    pub fn resize(&mut self, cols: u32, rows: u32) {
        self.config.cols = cols;
        self.config.rows = rows;
        if self.is_dead() {
            return;
        }
        if let Some(payload) = self.channel.window_change_payload(cols, rows) {
            self.send_payload(&payload);
        }
    }

    /// Caller close: a best-effort DISCONNECT, then the phase flips so
    /// everything later is discarded.
    pub fn close(&mut self) {
        if self.is_dead() {
            return;
        }
        if self.seal.is_some() {
            let mut payload = vec![msg::DISCONNECT];
            payload.push_u32_be(DISCONNECT_BY_APPLICATION);
            payload.extend_ssh_string(b"disconnected by user");
            payload.extend_ssh_string(b"");
            self.send_payload(&payload);
        }
        self.advance(Phase::Closed);
    }
}
