//! X25519 ephemeral exchange for `curve25519-sha256`.

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use zeroize::Zeroizing;

use crate::Error;

pub(crate) struct Curve25519 {
    local_secret: Scalar,
    public: MontgomeryPoint,
}

impl std::fmt::Debug for Curve25519 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Curve25519 {{ local_secret: [hidden] }}")
    }
}

impl Curve25519 {
    pub fn generate() -> Self {
        let local_secret = Scalar::from_bytes_mod_order(rand::random::<[u8; 32]>());
        let public = (ED25519_BASEPOINT_TABLE * &local_secret).to_montgomery();
        Curve25519 {
            local_secret,
            public,
        }
    }

    /// Our 32-byte ephemeral public `q_c`.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.0.to_vec()
    }

    /// The 32-byte shared secret with the peer's ephemeral public.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> Result<Vec<u8>, Error> {
        if peer_public.len() != 32 {
            return Err(Error::Kex);
        }
        let mut remote = MontgomeryPoint([0; 32]);
        remote.0.clone_from_slice(peer_public);
        let shared = Zeroizing::new(self.local_secret * remote);
        Ok(shared.0.to_vec())
    }
}
