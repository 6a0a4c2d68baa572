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

//! SSH binary packet framing and the RFC 4251 wire primitives.
//!
//! Everything here is pure: framing state (sequence numbers, IVs) lives in
//! [`crate::cipher`].

use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;

use crate::{Error, MAX_PACKET_SIZE};

pub(crate) const PACKET_LENGTH_LEN: usize = 4;
pub(crate) const PADDING_LENGTH_LEN: usize = 1;
pub(crate) const MIN_PADDING: usize = 4;
/// AES block size; also the padding alignment unit, since
/// `max(8, block_size) == 16` for aes128-ctr.
pub(crate) const BLOCK_LEN: usize = 16;

/// A parsed cleartext packet: the payload and how many input bytes the
/// packet occupied.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PlainPacket {
    pub payload: Vec<u8>,
    pub consumed: usize,
}

/// Padding needed for a payload of `payload_len` bytes.
///
/// In the encrypt-then-MAC layout the length field is sent in clear and is
/// excluded from the alignment computation; in the MAC-then-encrypt layout
/// it is encrypted along with the rest and counts toward it.
pub(crate) fn padding_length(payload_len: usize, etm: bool) -> usize {
    let covered = if etm {
        PADDING_LENGTH_LEN + payload_len
    } else {
        PACKET_LENGTH_LEN + PADDING_LENGTH_LEN + payload_len
    };
    MIN_PADDING + (BLOCK_LEN - ((covered + MIN_PADDING) % BLOCK_LEN)) % BLOCK_LEN
}

/// Frame `payload` as a cleartext SSH packet: length, padding length,
/// payload, random padding.
pub(crate) fn build_packet(payload: &[u8], etm: bool) -> Vec<u8> {
    let padding = padding_length(payload.len(), etm);
    let packet_length = PADDING_LENGTH_LEN + payload.len() + padding;

    let mut buf = Vec::with_capacity(PACKET_LENGTH_LEN + packet_length);
    buf.push_u32_be(packet_length as u32);
    buf.push(padding as u8);
    buf.extend_from_slice(payload);

    let pad_start = buf.len();
    buf.resize(pad_start + padding, 0);
    #[allow(clippy::indexing_slicing)] // just resized
    rand::thread_rng().fill_bytes(&mut buf[pad_start..]);
    buf
}

/// Parse one cleartext packet from the front of `data`.
///
/// Returns `Ok(None)` when `data` does not yet hold a complete packet.
pub(crate) fn parse_packet(data: &[u8]) -> Result<Option<PlainPacket>, Error> {
    if data.len() < PACKET_LENGTH_LEN + PADDING_LENGTH_LEN {
        return Ok(None);
    }
    let packet_length = BigEndian::read_u32(data) as usize;
    if packet_length > MAX_PACKET_SIZE || packet_length < PADDING_LENGTH_LEN + MIN_PADDING {
        return Err(Error::PacketSize(packet_length));
    }
    if data.len() < PACKET_LENGTH_LEN + packet_length {
        return Ok(None);
    }
    let padding = *data.get(PACKET_LENGTH_LEN).ok_or(Error::Truncated)? as usize;
    if padding < MIN_PADDING || padding > packet_length - PADDING_LENGTH_LEN {
        return Err(Error::PacketPadding(padding));
    }
    let payload_len = packet_length - PADDING_LENGTH_LEN - padding;
    let start = PACKET_LENGTH_LEN + PADDING_LENGTH_LEN;
    let payload = data
        .get(start..start + payload_len)
        .ok_or(Error::Truncated)?
        .to_vec();
    Ok(Some(PlainPacket {
        payload,
        consumed: PACKET_LENGTH_LEN + packet_length,
    }))
}

/// Big-endian writers for the RFC 4251 types, on plain byte buffers.
pub(crate) trait Encoding {
    /// Push a big endian-encoded `u32`.
    fn push_u32_be(&mut self, n: u32);
    /// Push a length-prefixed byte string.
    fn extend_ssh_string(&mut self, s: &[u8]);
    /// Push a length-prefixed, comma-separated name list.
    fn extend_list<A: AsRef<str>, I: Iterator<Item = A>>(&mut self, list: I);
    /// Push the big-endian magnitude `s` as an SSH mpint: leading zeros
    /// stripped, a zero byte prepended when the top bit is set, zero
    /// encoded as the empty string.
    fn extend_mpint(&mut self, s: &[u8]);
}

impl Encoding for Vec<u8> {
    fn push_u32_be(&mut self, n: u32) {
        self.extend_from_slice(&n.to_be_bytes());
    }

    fn extend_ssh_string(&mut self, s: &[u8]) {
        self.push_u32_be(s.len() as u32);
        self.extend_from_slice(s);
    }

    fn extend_list<A: AsRef<str>, I: Iterator<Item = A>>(&mut self, list: I) {
        let i0 = self.len();
        self.push_u32_be(0);
        let mut first = true;
        for name in list {
            if !first {
                self.push(b',');
            }
            first = false;
            self.extend_from_slice(name.as_ref().as_bytes());
        }
        let len = (self.len() - i0 - 4) as u32;
        #[allow(clippy::indexing_slicing)] // written above
        BigEndian::write_u32(&mut self[i0..], len);
    }

    fn extend_mpint(&mut self, s: &[u8]) {
        // Skip initial 0s.
        let mut i = 0;
        while i < s.len() && s.get(i) == Some(&0) {
            i += 1
        }
        let s = s.get(i..).unwrap_or(&[]);
        match s.first() {
            None => self.push_u32_be(0),
            Some(&b) if b & 0x80 != 0 => {
                self.push_u32_be((s.len() + 1) as u32);
                self.push(0);
                self.extend_from_slice(s);
            }
            Some(_) => {
                self.extend_ssh_string(s);
            }
        }
    }
}

/// Bounds-checked reader over a packet payload. Truncation is a protocol
/// error here: by the time a payload reaches a reader, the packet framing
/// has already guaranteed completeness.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    /// Reader positioned after the message-type byte.
    pub fn payload(data: &'a [u8]) -> Self {
        Reader { data, pos: 1 }
    }

    pub fn read_byte(&mut self) -> Result<u8, Error> {
        let b = *self.data.get(self.pos).ok_or(Error::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let s = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(Error::Truncated)?;
        self.pos += 4;
        Ok(BigEndian::read_u32(s))
    }

    pub fn read_string(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_u32()? as usize;
        let s = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or(Error::Truncated)?;
        self.pos += len;
        Ok(s)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), Error> {
        if self.pos + n > self.data.len() {
            return Err(Error::Truncated);
        }
        self.pos += n;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_encodes_as_four_zero_bytes() {
        let mut buf = Vec::new();
        buf.extend_ssh_string(b"");
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn mpint_sign_handling() {
        // 256 = 0x0100: top bit of 0x01 clear, two bytes.
        let mut buf = Vec::new();
        buf.extend_mpint(&256u16.to_be_bytes());
        assert_eq!(buf, [0, 0, 0, 2, 1, 0]);

        // 128 = 0x80: top bit set, needs a leading zero.
        let mut buf = Vec::new();
        buf.extend_mpint(&[0x80]);
        assert_eq!(buf, [0, 0, 0, 2, 0, 0x80]);

        // Zero encodes as the empty string.
        let mut buf = Vec::new();
        buf.extend_mpint(&[0, 0, 0]);
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn build_then_parse_round_trips() {
        for etm in [false, true] {
            for len in [0usize, 1, 4, 15, 16, 17, 255, 4096] {
                let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
                let packet = build_packet(&payload, etm);
                let parsed = parse_packet(&packet).unwrap().unwrap();
                assert_eq!(parsed.payload, payload, "etm={etm} len={len}");
                assert_eq!(parsed.consumed, packet.len());
            }
        }
    }

    #[test]
    fn padding_is_valid_and_aligned() {
        for etm in [false, true] {
            for len in 0..200usize {
                let padding = padding_length(len, etm);
                assert!((MIN_PADDING..=255).contains(&padding));
                let packet_length = PADDING_LENGTH_LEN + len + padding;
                let aligned = if etm {
                    packet_length
                } else {
                    PACKET_LENGTH_LEN + packet_length
                };
                assert_eq!(aligned % BLOCK_LEN, 0, "etm={etm} len={len}");
            }
        }
    }

    #[test]
    fn known_payload_framing() {
        let packet = build_packet(&[20, 1, 2, 3], false);
        let packet_length = BigEndian::read_u32(&packet) as usize;
        assert!(packet_length >= 1 + 4 + 4);
        assert!((4..=255).contains(&packet[4]));
        let parsed = parse_packet(&packet).unwrap().unwrap();
        assert_eq!(parsed.payload, [20, 1, 2, 3]);
    }

    #[test]
    fn parse_needs_more_iff_short() {
        let packet = build_packet(b"hello", true);
        for cut in 0..packet.len() {
            assert!(parse_packet(&packet[..cut]).unwrap().is_none(), "cut={cut}");
        }
        assert!(parse_packet(&packet).unwrap().is_some());
    }

    #[test]
    fn parse_rejects_bad_lengths() {
        // Oversized packet_length.
        let mut data = vec![0u8; 8];
        BigEndian::write_u32(&mut data, (MAX_PACKET_SIZE + 1) as u32);
        assert!(matches!(parse_packet(&data), Err(Error::PacketSize(_))));

        // Padding larger than the packet body.
        let mut data = Vec::new();
        data.push_u32_be(16);
        data.push(16);
        data.extend_from_slice(&[0; 16]);
        assert!(matches!(parse_packet(&data), Err(Error::PacketPadding(16))));
    }

    #[test]
    fn reader_errors_on_truncation() {
        let mut buf = Vec::new();
        buf.extend_ssh_string(b"abc");
        let mut r = Reader::new(&buf[..5]);
        assert!(matches!(r.read_string(), Err(Error::Truncated)));

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_string().unwrap(), b"abc");
        assert!(matches!(r.read_byte(), Err(Error::Truncated)));
    }
}
