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

//! The stateful transport cipher: aes128-ctr with HMAC-SHA-256, one
//! instance per direction, carrying the CTR keystream position and the
//! packet sequence number across packets.
//!
//! Failures never advance state: decryption runs on a clone of the
//! keystream and is committed only after the MAC and padding checks pass,
//! so the sequence number moves exactly once per packet actually accepted.

use std::num::Wrapping;

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use byteorder::{BigEndian, ByteOrder};
use ctr::Ctr128BE;

use crate::kex::KeyMaterial;
use crate::mac::{MacKey, HMAC_SHA256_SIZE};
use crate::wire::{self, PlainPacket, BLOCK_LEN, MIN_PADDING, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::{Error, MAX_PACKET_SIZE};

/// `aes128-ctr`
pub const AES_128_CTR: Name = Name("aes128-ctr");

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(pub(crate) &'static str);

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

/// Sequence number of the first encrypted packet in each direction.
///
/// The handshake script before NEWKEYS is fixed: each side sends exactly
/// KEXINIT (seq 0), its KEX init or reply (seq 1) and NEWKEYS (seq 2) in
/// clear, so both directions enter encryption at sequence number 3. The
/// identification line is not a packet and does not count.
pub(crate) const SEQ_AFTER_NEWKEYS: u32 = 3;

type Aes128Ctr = Ctr128BE<Aes128>;

/// Outbound direction: encrypt and authenticate.
pub(crate) struct SealingKey {
    cipher: Aes128Ctr,
    mac: MacKey,
    seqn: Wrapping<u32>,
}

/// Inbound direction: authenticate and decrypt.
pub(crate) struct OpeningKey {
    cipher: Aes128Ctr,
    mac: MacKey,
    seqn: Wrapping<u32>,
}

pub(crate) struct CipherPair {
    pub seal: SealingKey,
    pub open: OpeningKey,
}

impl CipherPair {
    /// Cipher pair for the client role: seals with the client-to-server
    /// keys, opens with the server-to-client keys.
    pub fn client(keys: &KeyMaterial, etm: bool) -> Self {
        CipherPair {
            seal: SealingKey::new(&keys.key_c2s, &keys.iv_c2s, MacKey::new(*keys.mac_c2s, etm)),
            open: OpeningKey::new(&keys.key_s2c, &keys.iv_s2c, MacKey::new(*keys.mac_s2c, etm)),
        }
    }

    /// The mirror of [`CipherPair::client`], used by in-process test peers.
    pub fn server(keys: &KeyMaterial, etm: bool) -> Self {
        CipherPair {
            seal: SealingKey::new(&keys.key_s2c, &keys.iv_s2c, MacKey::new(*keys.mac_s2c, etm)),
            open: OpeningKey::new(&keys.key_c2s, &keys.iv_c2s, MacKey::new(*keys.mac_c2s, etm)),
        }
    }
}

impl SealingKey {
    fn new(key: &[u8; 16], iv: &[u8; 16], mac: MacKey) -> Self {
        SealingKey {
            cipher: Aes128Ctr::new(&(*key).into(), &(*iv).into()),
            mac,
            seqn: Wrapping(SEQ_AFTER_NEWKEYS),
        }
    }

    /// Frame, encrypt and authenticate one payload, returning the wire
    /// bytes `ciphertext || tag`.
    pub fn seal(&mut self, payload: &[u8]) -> Vec<u8> {
        let etm = self.mac.is_etm();
        let mut packet = wire::build_packet(payload, etm);

        let tag = if etm {
            // Leave the length field in clear, encrypt the rest, then MAC
            // over seqn || length || ciphertext.
            #[allow(clippy::indexing_slicing)] // always longer than the length field
            self.cipher.apply_keystream(&mut packet[PACKET_LENGTH_LEN..]);
            self.mac.compute(self.seqn.0, &packet)
        } else {
            // MAC over seqn || plaintext packet, then encrypt everything.
            let tag = self.mac.compute(self.seqn.0, &packet);
            self.cipher.apply_keystream(&mut packet);
            tag
        };

        packet.extend_from_slice(&tag);
        // Sequence numbers are on 32 bits and wrap.
        // https://tools.ietf.org/html/rfc4253#section-6.4
        self.seqn += Wrapping(1);
        packet
    }

    #[cfg(test)]
    pub fn seqn(&self) -> u32 {
        self.seqn.0
    }
}

impl OpeningKey {
    fn new(key: &[u8; 16], iv: &[u8; 16], mac: MacKey) -> Self {
        OpeningKey {
            cipher: Aes128Ctr::new(&(*key).into(), &(*iv).into()),
            mac,
            seqn: Wrapping(SEQ_AFTER_NEWKEYS),
        }
    }

    /// Authenticate and decrypt one packet from the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` does not yet hold a complete
    /// encrypted packet; every other failure is fatal to the connection.
    pub fn open(&mut self, data: &[u8]) -> Result<Option<PlainPacket>, Error> {
        if self.mac.is_etm() {
            self.open_etm(data)
        } else {
            self.open_std(data)
        }
    }

    fn open_etm(&mut self, data: &[u8]) -> Result<Option<PlainPacket>, Error> {
        if data.len() < PACKET_LENGTH_LEN + HMAC_SHA256_SIZE {
            return Ok(None);
        }
        let packet_length = BigEndian::read_u32(data) as usize;
        validate_packet_length(packet_length)?;
        let total = PACKET_LENGTH_LEN + packet_length + HMAC_SHA256_SIZE;
        if data.len() < total {
            return Ok(None);
        }

        let (authed, rest) = data.split_at(PACKET_LENGTH_LEN + packet_length);
        let tag = rest.get(..HMAC_SHA256_SIZE).ok_or(Error::Truncated)?;
        if !self.mac.verify(self.seqn.0, authed, tag) {
            return Err(Error::PacketAuth);
        }

        let mut cipher = self.cipher.clone();
        let mut inner = authed
            .get(PACKET_LENGTH_LEN..)
            .ok_or(Error::Truncated)?
            .to_vec();
        cipher.apply_keystream(&mut inner);

        let payload = extract_payload(&inner, packet_length)?;
        self.cipher = cipher;
        self.seqn += Wrapping(1);
        Ok(Some(PlainPacket {
            payload,
            consumed: total,
        }))
    }

    fn open_std(&mut self, data: &[u8]) -> Result<Option<PlainPacket>, Error> {
        if data.len() < BLOCK_LEN + HMAC_SHA256_SIZE {
            return Ok(None);
        }

        // Peek the length field out of the first block without advancing
        // the real keystream.
        let mut cipher = self.cipher.clone();
        let mut first_block = data.get(..BLOCK_LEN).ok_or(Error::Truncated)?.to_vec();
        cipher.apply_keystream(&mut first_block);
        let packet_length = BigEndian::read_u32(&first_block) as usize;
        validate_packet_length(packet_length)?;
        // In this layout the length field is encrypted with the body, so
        // the whole unit must be block-aligned.
        if (PACKET_LENGTH_LEN + packet_length) % BLOCK_LEN != 0 {
            return Err(Error::PacketSize(packet_length));
        }

        let total = PACKET_LENGTH_LEN + packet_length + HMAC_SHA256_SIZE;
        if data.len() < total {
            return Ok(None);
        }

        // Decrypt the remainder, continuing the counter from the first
        // block.
        let mut packet = first_block;
        let mut rest = data
            .get(BLOCK_LEN..PACKET_LENGTH_LEN + packet_length)
            .ok_or(Error::Truncated)?
            .to_vec();
        cipher.apply_keystream(&mut rest);
        packet.extend_from_slice(&rest);

        let tag = data
            .get(PACKET_LENGTH_LEN + packet_length..total)
            .ok_or(Error::Truncated)?;
        if !self.mac.verify(self.seqn.0, &packet, tag) {
            return Err(Error::PacketAuth);
        }

        let inner = packet.get(PACKET_LENGTH_LEN..).ok_or(Error::Truncated)?;
        let payload = extract_payload(inner, packet_length)?;
        self.cipher = cipher;
        self.seqn += Wrapping(1);
        Ok(Some(PlainPacket {
            payload,
            consumed: total,
        }))
    }

    #[cfg(test)]
    pub fn seqn(&self) -> u32 {
        self.seqn.0
    }
}

fn validate_packet_length(packet_length: usize) -> Result<(), Error> {
    if packet_length > MAX_PACKET_SIZE || packet_length < PADDING_LENGTH_LEN + MIN_PADDING {
        return Err(Error::PacketSize(packet_length));
    }
    Ok(())
}

/// Strip the padding-length byte and the padding from a decrypted packet
/// body of `packet_length - 4` bytes.
fn extract_payload(inner: &[u8], packet_length: usize) -> Result<Vec<u8>, Error> {
    let padding = *inner.first().ok_or(Error::Truncated)? as usize;
    if padding < MIN_PADDING || padding > packet_length - PADDING_LENGTH_LEN {
        return Err(Error::PacketPadding(padding));
    }
    let payload_len = packet_length - PADDING_LENGTH_LEN - padding;
    Ok(inner
        .get(PADDING_LENGTH_LEN..PADDING_LENGTH_LEN + payload_len)
        .ok_or(Error::Truncated)?
        .to_vec())
}
