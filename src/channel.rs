//! The single interactive session channel (RFC 4254): open, PTY, shell,
//! data in both directions, window accounting and resize.

use log::{debug, warn};

use crate::wire::{Encoding, Reader};
use crate::{msg, Error, CHANNEL_MAX_PACKET, DEFAULT_WINDOW_SIZE};

/// Our channel number in CHANNEL_OPEN. There is only ever one channel.
pub(crate) const LOCAL_CHANNEL_ID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ChannelPhase {
    Init,
    Opening,
    Open,
    PtyRequested,
    ShellRequested,
    Active,
    Closed,
}

/// State of the session channel. `remote_id == 0` doubles as the
/// not-yet-confirmed sentinel; the requests that need the real id check
/// it before building anything.
#[derive(Debug)]
pub(crate) struct Channel {
    pub phase: ChannelPhase,
    pub remote_id: u32,
    pub local_window: u32,
    pub remote_window: u32,
    pub remote_max_packet: u32,
    pub pty_sent: bool,
    pub shell_sent: bool,
}

impl Channel {
    pub fn new() -> Self {
        Channel {
            phase: ChannelPhase::Init,
            remote_id: 0,
            local_window: DEFAULT_WINDOW_SIZE,
            remote_window: DEFAULT_WINDOW_SIZE,
            remote_max_packet: CHANNEL_MAX_PACKET,
            pty_sent: false,
            shell_sent: false,
        }
    }

    /// CHANNEL_OPEN for a "session" channel.
    pub fn open_payload(&mut self) -> Vec<u8> {
        self.phase = ChannelPhase::Opening;
        let mut payload = vec![msg::CHANNEL_OPEN];
        payload.extend_ssh_string(b"session");
        payload.push_u32_be(LOCAL_CHANNEL_ID);
        payload.push_u32_be(DEFAULT_WINDOW_SIZE);
        payload.push_u32_be(CHANNEL_MAX_PACKET);
        payload
    }

    /// Record a CHANNEL_OPEN_CONFIRMATION.
    pub fn confirm(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut r = Reader::payload(payload);
        let recipient = r.read_u32()?;
        if recipient != LOCAL_CHANNEL_ID {
            warn!("confirmation for unknown channel {recipient}");
            return Err(Error::Inconsistent);
        }
        self.remote_id = r.read_u32()?;
        self.remote_window = r.read_u32()?;
        self.remote_max_packet = r.read_u32()?;
        self.phase = ChannelPhase::Open;
        debug!(
            "channel open: remote id {}, window {}, max packet {}",
            self.remote_id, self.remote_window, self.remote_max_packet
        );
        Ok(())
    }

    /// CHANNEL_REQUEST "pty-req" with the configured terminal. Pixel
    /// dimensions are zero and the mode string is the single TTY_OP_END
    /// byte.
    pub fn pty_request_payload(&mut self, term: &str, cols: u32, rows: u32) -> Vec<u8> {
        self.phase = ChannelPhase::PtyRequested;
        self.pty_sent = true;
        let mut payload = vec![msg::CHANNEL_REQUEST];
        payload.push_u32_be(self.remote_id);
        payload.extend_ssh_string(b"pty-req");
        payload.push(1); // want_reply
        payload.extend_ssh_string(term.as_bytes());
        payload.push_u32_be(cols);
        payload.push_u32_be(rows);
        payload.push_u32_be(0); // pixel width
        payload.push_u32_be(0); // pixel height
        payload.extend_ssh_string(&[0]); // terminal modes: TTY_OP_END
        payload
    }

    /// CHANNEL_REQUEST "shell".
    pub fn shell_payload(&mut self) -> Vec<u8> {
        self.phase = ChannelPhase::ShellRequested;
        self.shell_sent = true;
        let mut payload = vec![msg::CHANNEL_REQUEST];
        payload.push_u32_be(self.remote_id);
        payload.extend_ssh_string(b"shell");
        payload.push(1); // want_reply
        payload
    }

    /// CHANNEL_REQUEST "window-change", fire-and-forget. `None` until the
    /// channel is confirmed.
    pub fn window_change_payload(&self, cols: u32, rows: u32) -> Option<Vec<u8>> {
        if self.remote_id == 0 {
            return None;
        }
        let mut payload = vec![msg::CHANNEL_REQUEST];
        payload.push_u32_be(self.remote_id);
        payload.extend_ssh_string(b"window-change");
        payload.push(0); // no reply
        payload.push_u32_be(cols);
        payload.push_u32_be(rows);
        payload.push_u32_be(0);
        payload.push_u32_be(0);
        Some(payload)
    }

    /// CHANNEL_DATA packets for `data`, split by the remote maximum
    /// packet size. Empty until the shell request has been sent.
    pub fn data_payloads(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if !self.shell_sent {
            debug!("dropping {} bytes written before shell", data.len());
            return Vec::new();
        }
        let mut payloads = Vec::new();
        for chunk in data.chunks(self.remote_max_packet.max(1) as usize) {
            if self.remote_window < chunk.len() as u32 {
                // An interactive server replenishes the window far faster
                // than keystrokes consume it; a stall here means the peer
                // stopped reading.
                warn!("remote window exhausted, sending anyway");
            }
            self.remote_window = self.remote_window.saturating_sub(chunk.len() as u32);
            let mut payload = vec![msg::CHANNEL_DATA];
            payload.push_u32_be(self.remote_id);
            payload.extend_ssh_string(chunk);
            payloads.push(payload);
        }
        payloads
    }

    /// CHANNEL_WINDOW_ADJUST returning `n` consumed bytes to the server.
    /// Every delivered byte is credited straight back, so `local_window`
    /// never drifts from its initial value.
    pub fn window_adjust_payload(&mut self, n: u32) -> Vec<u8> {
        let mut payload = vec![msg::CHANNEL_WINDOW_ADJUST];
        payload.push_u32_be(self.remote_id);
        payload.push_u32_be(n);
        payload
    }

    /// Server granted us more room to write.
    pub fn credit_remote(&mut self, n: u32) {
        self.remote_window = self.remote_window.saturating_add(n);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;

    fn confirmed_channel() -> Channel {
        let mut ch = Channel::new();
        ch.open_payload();
        let mut confirmation = vec![msg::CHANNEL_OPEN_CONFIRMATION];
        confirmation.push_u32_be(LOCAL_CHANNEL_ID);
        confirmation.push_u32_be(7);
        confirmation.push_u32_be(0x10000);
        confirmation.push_u32_be(0x400);
        ch.confirm(&confirmation).unwrap();
        ch
    }

    #[test]
    fn open_payload_layout() {
        let mut ch = Channel::new();
        let payload = ch.open_payload();
        let mut r = Reader::payload(&payload);
        assert_eq!(payload[0], msg::CHANNEL_OPEN);
        assert_eq!(r.read_string().unwrap(), b"session");
        assert_eq!(r.read_u32().unwrap(), LOCAL_CHANNEL_ID);
        assert_eq!(r.read_u32().unwrap(), DEFAULT_WINDOW_SIZE);
        assert_eq!(r.read_u32().unwrap(), CHANNEL_MAX_PACKET);
        assert_eq!(ch.phase, ChannelPhase::Opening);
    }

    #[test]
    fn confirmation_is_recorded() {
        let ch = confirmed_channel();
        assert_eq!(ch.remote_id, 7);
        assert_eq!(ch.remote_window, 0x10000);
        assert_eq!(ch.remote_max_packet, 0x400);
        assert_eq!(ch.phase, ChannelPhase::Open);
    }

    #[test]
    fn pty_request_layout() {
        let mut ch = confirmed_channel();
        let payload = ch.pty_request_payload("xterm-256color", 120, 40);
        let mut r = Reader::payload(&payload);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_string().unwrap(), b"pty-req");
        assert_eq!(r.read_byte().unwrap(), 1);
        assert_eq!(r.read_string().unwrap(), b"xterm-256color");
        assert_eq!(r.read_u32().unwrap(), 120);
        assert_eq!(r.read_u32().unwrap(), 40);
        assert_eq!(r.read_u32().unwrap(), 0);
        assert_eq!(r.read_u32().unwrap(), 0);
        assert_eq!(r.read_string().unwrap(), [0]);
        assert!(ch.pty_sent);
    }

    #[test]
    fn resize_is_a_noop_before_confirmation() {
        let ch = Channel::new();
        assert!(ch.window_change_payload(100, 50).is_none());

        let ch = confirmed_channel();
        let payload = ch.window_change_payload(100, 50).unwrap();
        let mut r = Reader::payload(&payload);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_string().unwrap(), b"window-change");
        assert_eq!(r.read_byte().unwrap(), 0);
        assert_eq!(r.read_u32().unwrap(), 100);
    }

    #[test]
    fn write_is_a_noop_before_shell() {
        let mut ch = confirmed_channel();
        assert!(ch.data_payloads(b"too early").is_empty());

        ch.shell_payload();
        let payloads = ch.data_payloads(b"ls\n");
        assert_eq!(payloads.len(), 1);
        let mut r = Reader::payload(&payloads[0]);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_string().unwrap(), b"ls\n");
    }

    #[test]
    fn large_writes_split_by_remote_max_packet() {
        let mut ch = confirmed_channel();
        ch.shell_payload();
        let window_before = ch.remote_window;
        let data = vec![b'x'; 0x400 * 2 + 5];
        let payloads = ch.data_payloads(&data);
        assert_eq!(payloads.len(), 3);
        let mut r = Reader::payload(&payloads[2]);
        r.read_u32().unwrap();
        assert_eq!(r.read_string().unwrap().len(), 5);
        assert_eq!(ch.remote_window, window_before - data.len() as u32);
    }

    #[test]
    fn window_adjust_matches_delivered_bytes() {
        let mut ch = confirmed_channel();
        let payload = ch.window_adjust_payload(5);
        let mut r = Reader::payload(&payload);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 5);
    }
}
