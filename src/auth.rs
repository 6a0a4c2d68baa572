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

//! Public-key authentication with an OpenSSH certificate (RFC 4252).
//!
//! The client short-circuits the usual probe round: the first
//! USERAUTH_REQUEST already carries the signature. Servers that treat it
//! as the query form anyway and answer PK_OK get a second, freshly signed
//! request.

use log::debug;
use signature::Signer;
use ssh_encoding::Encode;
use ssh_key::{Certificate, PrivateKey};

use crate::wire::{Encoding, Reader};
use crate::{msg, Error};

/// What we authenticate with: a username, an SSH certificate (its wire
/// key-type tag plus the opaque blob), and the matching Ed25519 private
/// key as an opaque signing handle.
pub struct Credentials {
    pub username: String,
    pub key_type: String,
    pub cert_blob: Vec<u8>,
    key: PrivateKey,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        key_type: impl Into<String>,
        cert_blob: Vec<u8>,
        key: PrivateKey,
    ) -> Self {
        Credentials {
            username: username.into(),
            key_type: key_type.into(),
            cert_blob,
            key,
        }
    }

    /// Build credentials from a parsed OpenSSH certificate. The wire blob
    /// and its leading key-type tag are extracted from the certificate's
    /// own encoding.
    pub fn from_certificate(
        username: impl Into<String>,
        cert: &Certificate,
        key: PrivateKey,
    ) -> Result<Self, Error> {
        let mut cert_blob = Vec::new();
        cert.encode(&mut cert_blob)?;
        let key_type = {
            let mut r = Reader::new(&cert_blob);
            String::from_utf8_lossy(r.read_string()?).into_owned()
        };
        Ok(Credentials::new(username, key_type, cert_blob, key))
    }

    /// `ssh-ed25519` certificates sign under the plain `ssh-ed25519`
    /// algorithm name; anything else signs under its own key type.
    pub(crate) fn signature_algorithm(&self) -> &str {
        if self.key_type.starts_with("ssh-ed25519") {
            "ssh-ed25519"
        } else {
            &self.key_type
        }
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let signature: ssh_key::Signature = self.key.try_sign(data)?;
        let mut blob = Vec::new();
        blob.extend_ssh_string(self.signature_algorithm().as_bytes());
        blob.extend_ssh_string(signature.as_bytes());
        Ok(blob)
    }

    /// The USERAUTH_REQUEST payload with the signature attached. The
    /// signature covers `string(session_id) || request-without-signature`.
    pub(crate) fn request_payload(&self, session_id: &[u8]) -> Result<Vec<u8>, Error> {
        let mut buffer = Vec::new();
        buffer.extend_ssh_string(session_id);
        let i0 = buffer.len();
        buffer.push(msg::USERAUTH_REQUEST);
        buffer.extend_ssh_string(self.username.as_bytes());
        buffer.extend_ssh_string(b"ssh-connection");
        buffer.extend_ssh_string(b"publickey");
        buffer.push(1);
        buffer.extend_ssh_string(self.key_type.as_bytes());
        buffer.extend_ssh_string(&self.cert_blob);

        let signature = self.sign(&buffer)?;
        let mut payload = buffer.split_off(i0);
        payload.extend_ssh_string(&signature);
        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthPhase {
    Init,
    ServiceRequested,
    Signed,
    Complete,
    Failed,
}

/// Client-side authentication progress.
#[derive(Debug)]
pub(crate) struct Auth {
    pub phase: AuthPhase,
    /// Set when the server answered our signed request with PK_OK,
    /// meaning it took the request for a key query. Distinguishes "key
    /// rejected" from "signature rejected" in failure messages.
    pub received_pk_ok: bool,
}

impl Auth {
    pub fn new() -> Self {
        Auth {
            phase: AuthPhase::Init,
            received_pk_ok: false,
        }
    }

    pub fn service_requested(&mut self) {
        debug_assert!(self.phase == AuthPhase::Init);
        self.phase = AuthPhase::ServiceRequested;
    }

    pub fn signed(&mut self) {
        self.phase = AuthPhase::Signed;
    }

    pub fn pk_ok(&mut self) {
        debug!("server answered the signed request with PK_OK");
        self.received_pk_ok = true;
    }

    pub fn success(&mut self) {
        self.phase = AuthPhase::Complete;
    }

    /// Digest a USERAUTH_FAILURE payload into the terminal error.
    pub fn failure(&mut self, payload: &[u8]) -> Error {
        self.phase = AuthPhase::Failed;
        let methods = Reader::payload(payload)
            .read_string()
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .unwrap_or_default();
        let what = if self.received_pk_ok {
            "server accepted the key but rejected the signature"
        } else {
            "server rejected the certificate key"
        };
        Error::Auth(format!("{what} (methods that can continue: {methods})"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;
    use signature::Verifier;
    use ssh_key::Algorithm;

    fn test_credentials() -> Credentials {
        let key = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519).unwrap();
        Credentials::new(
            "tester",
            "ssh-ed25519-cert-v01@openssh.com",
            b"opaque cert blob".to_vec(),
            key,
        )
    }

    #[test]
    fn signature_algorithm_rule() {
        let creds = test_credentials();
        assert_eq!(creds.signature_algorithm(), "ssh-ed25519");

        let key = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519).unwrap();
        let creds = Credentials::new("t", "rsa-sha2-256-cert-v01@openssh.com", vec![], key);
        assert_eq!(creds.signature_algorithm(), "rsa-sha2-256-cert-v01@openssh.com");
    }

    #[test]
    fn request_payload_layout_and_signature() {
        let creds = test_credentials();
        let session_id = [0xabu8; 32];
        let payload = creds.request_payload(&session_id).unwrap();

        let mut r = Reader::payload(&payload);
        assert_eq!(payload[0], msg::USERAUTH_REQUEST);
        assert_eq!(r.read_string().unwrap(), b"tester");
        assert_eq!(r.read_string().unwrap(), b"ssh-connection");
        assert_eq!(r.read_string().unwrap(), b"publickey");
        assert_eq!(r.read_byte().unwrap(), 1);
        assert_eq!(
            r.read_string().unwrap(),
            b"ssh-ed25519-cert-v01@openssh.com"
        );
        assert_eq!(r.read_string().unwrap(), b"opaque cert blob");

        // The trailing field is string(sig-alg) || string(raw signature),
        // and the signature verifies over session-id-prefixed data.
        let sig_blob = r.read_string().unwrap();
        let mut sr = Reader::new(sig_blob);
        assert_eq!(sr.read_string().unwrap(), b"ssh-ed25519");
        let raw = sr.read_string().unwrap();

        let mut signed = Vec::new();
        signed.extend_ssh_string(&session_id);
        let sig_field_len = 4 + sig_blob.len();
        signed.extend_from_slice(&payload[..payload.len() - sig_field_len]);

        let sig = ssh_key::Signature::new(Algorithm::Ed25519, raw.to_vec()).unwrap();
        Verifier::verify(creds.key.public_key(), &signed, &sig).unwrap();
    }

    #[test]
    fn failure_messages_distinguish_pk_ok() {
        let mut failure_payload = vec![msg::USERAUTH_FAILURE];
        failure_payload.extend_ssh_string(b"publickey,password");
        failure_payload.push(0);

        let mut auth = Auth::new();
        let err = auth.failure(&failure_payload);
        assert!(format!("{err}").contains("rejected the certificate key"));
        assert!(format!("{err}").contains("publickey,password"));

        let mut auth = Auth::new();
        auth.pk_ok();
        let err = auth.failure(&failure_payload);
        assert!(format!("{err}").contains("rejected the signature"));
        assert_eq!(auth.phase, AuthPhase::Failed);
    }
}
