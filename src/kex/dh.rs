//! Finite-field Diffie-Hellman over the RFC 3526 MODP group 14, for
//! `diffie-hellman-group14-sha256`.

use hex_literal::hex;
use num_bigint::{BigUint, RandBigInt};

use crate::Error;

/// Bits of private exponent; twice the ~110-bit security of group 14.
const EXPONENT_BITS: u64 = 256;

pub(crate) const DH_GROUP14_PRIME: &[u8] = &hex!(
    "
    FFFFFFFF FFFFFFFF C90FDAA2 2168C234 C4C6628B 80DC1CD1
    29024E08 8A67CC74 020BBEA6 3B139B22 514A0879 8E3404DD
    EF9519B3 CD3A431B 302B0A6D F25F1437 4FE1356D 6D51C245
    E485B576 625E7EC6 F44C42E9 A637ED6B 0BFF5CB6 F406B7ED
    EE386BFB 5A899FA5 AE9F2411 7C4B1FE6 49286651 ECE45B3D
    C2007CB8 A163BF05 98DA4836 1C55D39A 69163FA8 FD24CF5F
    83655D23 DCA3AD96 1C62F356 208552BB 9ED52907 7096966D
    670C354E 4ABC9804 F1746C08 CA18217C 32905E46 2E36CE3B
    E39E772C 180E8603 9B2783A2 EC07A28F B5C55DF0 6F4C52C9
    DE2BCBF6 95581718 3995497C EA956AE5 15D22618 98FA0510
    15728E5A 8AACAA68 FFFFFFFF FFFFFFFF
    "
);

pub(crate) const DH_GROUP14_GENERATOR: u8 = 2;

/// One side of a group-14 exchange.
pub(crate) struct DhGroup14 {
    prime: BigUint,
    private_key: BigUint,
    public_key: BigUint,
}

impl std::fmt::Debug for DhGroup14 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "DhGroup14 {{ private_key: [hidden] }}")
    }
}

impl DhGroup14 {
    /// Generate an ephemeral keypair. The private exponent is redrawn
    /// until the public value satisfies `1 < e < p - 1`.
    pub fn generate() -> Self {
        let prime = BigUint::from_bytes_be(DH_GROUP14_PRIME);
        let generator = BigUint::from(DH_GROUP14_GENERATOR);
        let one = BigUint::from(1u8);
        let prime_minus_one = &prime - &one;
        let mut rng = rand::thread_rng();
        loop {
            let private_key = rng.gen_biguint(EXPONENT_BITS);
            if private_key < BigUint::from(2u8) {
                continue;
            }
            let public_key = generator.modpow(&private_key, &prime);
            if public_key > one && public_key < prime_minus_one {
                return DhGroup14 {
                    prime,
                    private_key,
                    public_key,
                };
            }
        }
    }

    /// Big-endian magnitude of our public value `e`.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.to_bytes_be()
    }

    pub fn validate_public_key(&self, public_key: &BigUint) -> bool {
        let one = BigUint::from(1u8);
        let prime_minus_one = &self.prime - &one;
        public_key > &one && public_key < &prime_minus_one
    }

    /// `K = f^x mod p`, as a big-endian magnitude. Rejects degenerate
    /// peer values.
    pub fn compute_shared_secret(mut self, peer_public: &[u8]) -> Result<Vec<u8>, Error> {
        let peer = BigUint::from_bytes_be(peer_public);
        if !self.validate_public_key(&peer) {
            return Err(Error::Kex);
        }
        let shared = peer.modpow(&self.private_key, &self.prime);
        self.private_key = BigUint::default();
        Ok(shared.to_bytes_be())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_is_commutative() {
        let a = DhGroup14::generate();
        let b = DhGroup14::generate();
        let ea = a.public_key_bytes();
        let eb = b.public_key_bytes();
        let ka = a.compute_shared_secret(&eb).unwrap();
        let kb = b.compute_shared_secret(&ea).unwrap();
        assert_eq!(ka, kb);
        assert!(!ka.is_empty());
    }

    #[test]
    fn degenerate_peer_values_are_rejected() {
        for bad in [
            vec![0u8],
            vec![1u8],
            DH_GROUP14_PRIME.to_vec(),
            {
                // p - 1
                let p = BigUint::from_bytes_be(DH_GROUP14_PRIME);
                (p - 1u8).to_bytes_be()
            },
        ] {
            let dh = DhGroup14::generate();
            assert!(matches!(dh.compute_shared_secret(&bad), Err(Error::Kex)));
        }
    }

    #[test]
    fn public_key_is_in_range() {
        let dh = DhGroup14::generate();
        let e = BigUint::from_bytes_be(&dh.public_key_bytes());
        assert!(dh.validate_public_key(&e));
    }
}
