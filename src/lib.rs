#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
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

//! SSH-2 client over message-oriented byte transports.
//!
//! This crate speaks the SSH-2 protocol (RFC 4253/4252/4254) on top of any
//! transport that delivers binary frames, such as a WebSocket. It performs
//! the version exchange, one key exchange (`curve25519-sha256` or
//! `diffie-hellman-group14-sha256` with `aes128-ctr` and HMAC-SHA-256 in
//! either packet layout), authenticates with an OpenSSH certificate and an
//! Ed25519 key, opens a single interactive session channel with a
//! pseudo-terminal, and then ferries bytes between the caller and the
//! remote shell.
//!
//! The entry point is [`client::connect`]: hand it a [`client::Transport`],
//! a receiver of [`client::TransportEvent`]s, and [`auth::Credentials`], and
//! it returns a [`client::Connection`] handle with `write`, `on_data`,
//! `resize` and `close`.
//!
//! The crate is a client only. There is no rekeying, no compression, no
//! port forwarding, and no host-key trust policy: the raw server host-key
//! blob is surfaced to the caller, who is responsible for checking it
//! against a known-hosts store before trusting the session.

use thiserror::Error;

mod msg;
mod wire;

pub mod mac;
pub mod cipher;
pub mod kex;
mod negotiation;

pub mod auth;
mod channel;
mod session;

pub mod client;

#[cfg(test)]
mod tests;

pub use auth::Credentials;
pub use client::{connect, Connection, Options, Transport, TransportEvent};
pub use negotiation::{Names, Preferred};

/// Maximum length of an SSH packet payload we accept or emit.
/// <https://tools.ietf.org/html/rfc4253#section-6.1>
pub const MAX_PACKET_SIZE: usize = 35000;

/// Initial window size advertised for the session channel.
pub const DEFAULT_WINDOW_SIZE: u32 = 0x8000;

/// Maximum packet size advertised for the session channel.
pub const CHANNEL_MAX_PACKET: u32 = 0x2000;

/// How long we wait for the server's key-exchange reply.
pub const KEX_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(8000);

#[derive(Debug)]
pub enum AlgorithmKind {
    Kex,
    Cipher,
    Mac,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Unspecified problem with the beginning of key exchange.
    #[error("Key exchange init failed")]
    KexInit,

    /// Error during key exchange.
    #[error("Key exchange failed")]
    Kex,

    /// The server did not answer the key exchange in time.
    #[error("Key exchange timed out")]
    KexTimeout,

    /// No common algorithm found during key exchange.
    #[error("No common {kind:?} algorithm - ours: {ours:?}, theirs: {theirs:?}")]
    NoCommonAlgo {
        kind: AlgorithmKind,
        ours: Vec<String>,
        theirs: Vec<String>,
    },

    /// Invalid SSH identification string.
    #[error("invalid SSH version string")]
    Version,

    /// Invalid packet authentication code.
    #[error("Wrong packet authentication code")]
    PacketAuth,

    /// Excessive or undersized packet length field.
    #[error("Bad packet size: {0}")]
    PacketSize(usize),

    /// Padding length outside `[4, 255]` or larger than the packet.
    #[error("Bad padding length: {0}")]
    PacketPadding(usize),

    /// A length-prefixed field ran past the end of its buffer.
    #[error("Truncated packet field")]
    Truncated,

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// The server rejected our authentication request.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server refused to open the session channel.
    #[error("Failed to open channel: {0}")]
    ChannelOpenFailure(String),

    /// The server denied the shell request.
    #[error("Shell request denied")]
    ShellDenied,

    /// The server sent SSH_MSG_DISCONNECT.
    #[error("Disconnected by server ({reason}): {description}")]
    Disconnect { reason: u32, description: String },

    /// The byte transport closed before the session ended.
    #[error("Transport closed unexpectedly")]
    TransportClosed,

    #[error("Signature: {0}")]
    Signature(#[from] signature::Error),

    #[error("SshKey: {0}")]
    SshKey(#[from] ssh_key::Error),

    #[error("SshEncoding: {0}")]
    SshEncoding(#[from] ssh_encoding::Error),
}
