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

//! Key exchange: ephemeral keypairs, the exchange hash, and session key
//! derivation.
//!
//! This module exports kex algorithm names for use with [`crate::Preferred`].

pub(crate) mod curve25519;
pub(crate) mod dh;

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::wire::Encoding;
use crate::{msg, Error};

use curve25519::Curve25519;
use dh::DhGroup14;

/// `curve25519-sha256`
pub const CURVE25519: Name = Name("curve25519-sha256");
/// `curve25519-sha256@libssh.org`
pub const CURVE25519_PRE_RFC_8731: Name = Name("curve25519-sha256@libssh.org");
/// `diffie-hellman-group14-sha256`
pub const DH_G14_SHA256: Name = Name("diffie-hellman-group14-sha256");

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(pub(crate) &'static str);

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

/// The byte sequences hashed into the exchange hash, collected as the
/// handshake progresses. Identification lines are stored without their
/// line terminators; KEXINIT fields are the raw payloads including the
/// message-type byte; ephemerals are stored exactly as they appear inside
/// their length-prefixed hash fields (raw public for X25519, mpint body
/// for DH).
#[derive(Debug, Default, Clone)]
pub(crate) struct Exchange {
    pub client_id: Vec<u8>,
    pub server_id: Vec<u8>,
    pub client_kexinit: Vec<u8>,
    pub server_kexinit: Vec<u8>,
    pub client_ephemeral: Vec<u8>,
    pub server_ephemeral: Vec<u8>,
}

/// An in-flight key exchange of the negotiated flavor.
#[derive(Debug)]
pub(crate) enum KexAlgorithm {
    Curve25519(Curve25519),
    DhGroup14(DhGroup14),
}

impl KexAlgorithm {
    pub fn make(name: Name) -> Result<KexAlgorithm, Error> {
        if name == CURVE25519 || name == CURVE25519_PRE_RFC_8731 {
            Ok(KexAlgorithm::Curve25519(Curve25519::generate()))
        } else if name == DH_G14_SHA256 {
            Ok(KexAlgorithm::DhGroup14(DhGroup14::generate()))
        } else {
            Err(Error::KexInit)
        }
    }

    /// Our ephemeral public, in the form it takes inside its
    /// length-prefixed exchange-hash field.
    pub fn client_ephemeral(&self) -> Vec<u8> {
        match self {
            KexAlgorithm::Curve25519(kex) => kex.public_key_bytes(),
            KexAlgorithm::DhGroup14(kex) => mpint_body(&kex.public_key_bytes()),
        }
    }

    /// The KEXDH_INIT / KEX_ECDH_INIT payload carrying our ephemeral.
    pub fn client_init_payload(&self) -> Vec<u8> {
        let mut payload = vec![msg::KEX_ECDH_INIT];
        payload.extend_ssh_string(&self.client_ephemeral());
        payload
    }

    /// Consume the ephemeral secret against the server's public value
    /// (as received in the reply), producing the shared secret `K` as a
    /// big-endian magnitude.
    pub fn compute_shared_secret(self, server_ephemeral: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let shared = match self {
            KexAlgorithm::Curve25519(kex) => kex.compute_shared_secret(server_ephemeral)?,
            KexAlgorithm::DhGroup14(kex) => kex.compute_shared_secret(server_ephemeral)?,
        };
        Ok(Zeroizing::new(shared))
    }
}

/// Strip leading zeros and prepend a zero byte when the top bit is set:
/// the body of the SSH mpint encoding of a big-endian magnitude.
pub(crate) fn mpint_body(s: &[u8]) -> Vec<u8> {
    let mut i = 0;
    while i < s.len() && s.get(i) == Some(&0) {
        i += 1
    }
    let s = s.get(i..).unwrap_or(&[]);
    let mut body = Vec::with_capacity(s.len() + 1);
    if let Some(&b) = s.first() {
        if b & 0x80 != 0 {
            body.push(0);
        }
    }
    body.extend_from_slice(s);
    body
}

/// The exchange hash `H`: SHA-256 over the canonical transcript.
/// See RFC 5656 page 7 (ECDH) and RFC 4253 section 8 (DH); the two differ
/// only in the ephemeral encodings, which [`Exchange`] already fixes.
pub(crate) fn compute_exchange_hash(
    exchange: &Exchange,
    server_host_key: &[u8],
    shared: &[u8],
) -> [u8; 32] {
    let mut buffer = Vec::new();
    buffer.extend_ssh_string(&exchange.client_id);
    buffer.extend_ssh_string(&exchange.server_id);
    buffer.extend_ssh_string(&exchange.client_kexinit);
    buffer.extend_ssh_string(&exchange.server_kexinit);
    buffer.extend_ssh_string(server_host_key);
    buffer.extend_ssh_string(&exchange.client_ephemeral);
    buffer.extend_ssh_string(&exchange.server_ephemeral);
    buffer.extend_mpint(shared);

    let mut hasher = Sha256::new();
    hasher.update(&buffer);
    hasher.finalize().into()
}

/// The six derived session keys. Client-to-server and server-to-client
/// IVs, encryption keys and MAC keys, in RFC 4253 section 7.2 letter
/// order A through F.
pub(crate) struct KeyMaterial {
    pub iv_c2s: [u8; 16],
    pub iv_s2c: [u8; 16],
    pub key_c2s: Zeroizing<[u8; 16]>,
    pub key_s2c: Zeroizing<[u8; 16]>,
    pub mac_c2s: Zeroizing<[u8; 32]>,
    pub mac_s2c: Zeroizing<[u8; 32]>,
}

impl KeyMaterial {
    #[cfg(test)]
    pub fn test_pattern() -> Self {
        KeyMaterial {
            iv_c2s: [1; 16],
            iv_s2c: [2; 16],
            key_c2s: Zeroizing::new([3; 16]),
            key_s2c: Zeroizing::new([4; 16]),
            mac_c2s: Zeroizing::new([5; 32]),
            mac_s2c: Zeroizing::new([6; 32]),
        }
    }
}

/// Derive the session keys from the shared secret, the exchange hash and
/// the session identifier (RFC 4253 section 7.2).
///
/// SHA-256 output covers the largest key we need in one block, so the
/// iterated extension the RFC describes never runs here.
pub(crate) fn derive_keys(shared: &[u8], hash: &[u8; 32], session_id: &[u8]) -> KeyMaterial {
    let letter = |c: u8| -> [u8; 32] {
        let mut buffer = Vec::new();
        buffer.extend_mpint(shared);
        buffer.extend_from_slice(hash);
        buffer.push(c);
        buffer.extend_from_slice(session_id);
        let mut hasher = Sha256::new();
        hasher.update(&buffer);
        hasher.finalize().into()
    };
    let take16 = |block: [u8; 32]| -> [u8; 16] {
        let mut out = [0; 16];
        out.copy_from_slice(block.get(..16).unwrap_or(&[0; 16]));
        out
    };

    KeyMaterial {
        iv_c2s: take16(letter(b'A')),
        iv_s2c: take16(letter(b'B')),
        key_c2s: Zeroizing::new(take16(letter(b'C'))),
        key_s2c: Zeroizing::new(take16(letter(b'D'))),
        mac_c2s: Zeroizing::new(letter(b'E')),
        mac_s2c: Zeroizing::new(letter(b'F')),
    }
}
