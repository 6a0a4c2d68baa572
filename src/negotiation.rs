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

//! Building the client KEXINIT, parsing the server's, and picking the
//! algorithm triple by strict first-match against our preference order.

use std::borrow::Cow;
use std::str::from_utf8;

use log::debug;
use rand::RngCore;

use crate::wire::{Encoding, Reader};
use crate::{cipher, kex, mac, msg, AlgorithmKind, Error};

/// How many server entries a negotiation failure names in its diagnostic.
const THEIRS_IN_DIAGNOSTIC: usize = 4;

/// The negotiated algorithm triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Names {
    pub kex: kex::Name,
    pub cipher: cipher::Name,
    pub mac: mac::Name,
    /// The server announced a guessed kex packet that cannot match the
    /// negotiated algorithms; the next kex packet must be dropped.
    pub ignore_guessed: bool,
}

/// Lists of preferred algorithms, in preference order.
#[derive(Debug, Clone)]
pub struct Preferred {
    /// Preferred key exchange algorithms.
    pub kex: Cow<'static, [kex::Name]>,
    /// Preferred symmetric ciphers.
    pub cipher: Cow<'static, [cipher::Name]>,
    /// Preferred MAC algorithms.
    pub mac: Cow<'static, [mac::Name]>,
}

impl Preferred {
    pub const DEFAULT: Preferred = Preferred {
        kex: Cow::Borrowed(&[
            kex::CURVE25519,
            kex::CURVE25519_PRE_RFC_8731,
            kex::DH_G14_SHA256,
        ]),
        cipher: Cow::Borrowed(&[cipher::AES_128_CTR]),
        mac: Cow::Borrowed(&[mac::HMAC_SHA256_ETM, mac::HMAC_SHA256]),
    };
}

impl Default for Preferred {
    fn default() -> Preferred {
        Preferred::DEFAULT
    }
}

/// Host-key algorithms we advertise. The host key is only hashed, never
/// used for trust decisions here, so a single modern entry suffices.
const HOST_KEY_ALGOS: &[&str] = &["ssh-ed25519"];
const COMPRESSION_ALGOS: &[&str] = &["none"];

/// Build the client KEXINIT payload: message type, random cookie, the ten
/// name-lists, first_kex_packet_follows and the reserved field.
pub(crate) fn write_kexinit(prefs: &Preferred) -> Vec<u8> {
    let mut buf = vec![msg::KEXINIT];

    let mut cookie = [0; 16];
    rand::thread_rng().fill_bytes(&mut cookie);
    buf.extend_from_slice(&cookie);

    buf.extend_list(prefs.kex.iter().map(AsRef::as_ref)); // kex algos
    buf.extend_list(HOST_KEY_ALGOS.iter()); // host key algos
    buf.extend_list(prefs.cipher.iter().map(AsRef::as_ref)); // cipher client to server
    buf.extend_list(prefs.cipher.iter().map(AsRef::as_ref)); // cipher server to client
    buf.extend_list(prefs.mac.iter().map(AsRef::as_ref)); // mac client to server
    buf.extend_list(prefs.mac.iter().map(AsRef::as_ref)); // mac server to client
    buf.extend_list(COMPRESSION_ALGOS.iter()); // compression client to server
    buf.extend_list(COMPRESSION_ALGOS.iter()); // compression server to client
    buf.extend_list(std::iter::empty::<&str>()); // languages client to server
    buf.extend_list(std::iter::empty::<&str>()); // languages server to client

    buf.push(0); // first_kex_packet_follows: no guess
    buf.push_u32_be(0); // reserved
    buf
}

fn parse_algo_list(list: &[u8]) -> Vec<&str> {
    list.split(|&x| x == b',')
        .map(|x| from_utf8(x).unwrap_or_default())
        .collect()
}

/// First match from our preference list that the server also offers.
/// Also reports whether the match was the first choice of both sides,
/// which decides the fate of a guessed first kex packet.
fn select<S: AsRef<str> + Copy>(
    ours: &[S],
    theirs: &[&str],
    kind: AlgorithmKind,
) -> Result<(bool, S), Error> {
    let mut both_first_choice = true;
    for c in ours {
        for s in theirs {
            if s == &c.as_ref() {
                return Ok((both_first_choice, *c));
            }
            both_first_choice = false
        }
    }
    Err(Error::NoCommonAlgo {
        kind,
        ours: ours.iter().map(|x| x.as_ref().to_owned()).collect(),
        theirs: theirs
            .iter()
            .take(THEIRS_IN_DIAGNOSTIC)
            .map(|x| (*x).to_owned())
            .collect(),
    })
}

/// Parse the server KEXINIT payload and negotiate kex, cipher and MAC
/// independently. Both directions use the same cipher and MAC here, so
/// only the client-to-server lists are consulted for the pick and the
/// server-to-client lists must agree or negotiation fails on them too.
pub(crate) fn read_kexinit(payload: &[u8], prefs: &Preferred) -> Result<Names, Error> {
    let mut r = Reader::new(payload);
    r.skip(1 + 16)?; // message type and cookie

    let kex_string = r.read_string()?;
    let (kex_both_first, kex) =
        select(&prefs.kex, &parse_algo_list(kex_string), AlgorithmKind::Kex)?;

    r.read_string()?; // server host key algos: not negotiated, see above

    let cipher_c2s = r.read_string()?;
    let (_, cipher) = select(
        &prefs.cipher,
        &parse_algo_list(cipher_c2s),
        AlgorithmKind::Cipher,
    )?;
    let cipher_s2c = r.read_string()?;
    select(
        &prefs.cipher,
        &parse_algo_list(cipher_s2c),
        AlgorithmKind::Cipher,
    )?;

    let mac_c2s = r.read_string()?;
    let (_, mac) = select(&prefs.mac, &parse_algo_list(mac_c2s), AlgorithmKind::Mac)?;
    let mac_s2c = r.read_string()?;
    select(&prefs.mac, &parse_algo_list(mac_s2c), AlgorithmKind::Mac)?;

    r.read_string()?; // compression client to server
    r.read_string()?; // compression server to client
    r.read_string()?; // languages client to server
    r.read_string()?; // languages server to client
    let follows = r.read_byte()? != 0;

    let names = Names {
        kex,
        cipher,
        mac,
        // Ignore the next kex packet if (1) it follows and (2) it's not
        // the correct guess.
        ignore_guessed: follows && !kex_both_first,
    };
    debug!(
        "negotiated algorithms: {} / {} / {}",
        names.kex.as_ref(),
        names.cipher.as_ref(),
        names.mac.as_ref()
    );
    Ok(names)
}
