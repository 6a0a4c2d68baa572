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

//! HMAC-SHA-256 packet integrity, in the two layouts SSH knows: the
//! classic MAC-then-encrypt form that authenticates the plaintext packet,
//! and `-etm@openssh.com`, which authenticates the cleartext length field
//! plus the ciphertext.
//!
//! This module exports MAC names for use with [`crate::Preferred`].

use digest::{CtOutput, Output};
use hmac::{Hmac, Mac as _};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Output and key size of HMAC-SHA-256 on the wire.
pub const HMAC_SHA256_SIZE: usize = 32;

/// `hmac-sha2-256`
pub const HMAC_SHA256: Name = Name("hmac-sha2-256");
/// `hmac-sha2-256-etm@openssh.com`
pub const HMAC_SHA256_ETM: Name = Name("hmac-sha2-256-etm@openssh.com");

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(pub(crate) &'static str);

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

impl Name {
    /// Whether this layout authenticates ciphertext (encrypt-then-MAC).
    pub(crate) fn is_etm(&self) -> bool {
        *self == HMAC_SHA256_ETM
    }
}

/// A keyed MAC for one direction.
pub(crate) struct MacKey {
    key: Zeroizing<[u8; HMAC_SHA256_SIZE]>,
    etm: bool,
}

impl MacKey {
    pub fn new(key: [u8; HMAC_SHA256_SIZE], etm: bool) -> Self {
        MacKey {
            key: Zeroizing::new(key),
            etm,
        }
    }

    pub fn is_etm(&self) -> bool {
        self.etm
    }

    fn hmac(&self, sequence_number: u32, packet: &[u8]) -> CtOutput<Hmac<Sha256>> {
        #[allow(clippy::unwrap_used)] // HMAC accepts any key length
        let mut hmac = Hmac::<Sha256>::new_from_slice(&*self.key).unwrap();
        hmac.update(&sequence_number.to_be_bytes());
        hmac.update(packet);
        hmac.finalize()
    }

    /// MAC over `u32(seqn) || packet`.
    pub fn compute(&self, sequence_number: u32, packet: &[u8]) -> [u8; HMAC_SHA256_SIZE] {
        self.hmac(sequence_number, packet).into_bytes().into()
    }

    /// Constant-time comparison against a received tag.
    pub fn verify(&self, sequence_number: u32, packet: &[u8], tag: &[u8]) -> bool {
        if tag.len() != HMAC_SHA256_SIZE {
            return false;
        }
        let mut received = Output::<Hmac<Sha256>>::default();
        received.copy_from_slice(tag);
        self.hmac(sequence_number, packet) == CtOutput::new(received)
    }
}
