//! Per-epoch packet protection (draft-12 QUIC-TLS).
//!
//! Every packet is sealed under the keys of its epoch with AES-128-GCM.
//! The associated data is the serialized header; the nonce is the derived
//! IV with the packet number XORed into its trailing eight bytes. Initial
//! keys derive from the client's initial destination connection ID with a
//! fixed salt; every other epoch's secrets come from the TLS engine.

use ring::aead;
use ring::hkdf;

use crate::error::{Error, LocalError, QuicError, Result};
use crate::packet::SpaceId;
use crate::{ConnectionId, Side};

/// AEAD tag length appended to every protected payload.
pub const TAG_LEN: usize = 16;

/// Fixed salt for initial-secret extraction (draft-12 Section 5.2.2).
pub const INITIAL_SALT: [u8; 20] = [
    0x9c, 0x10, 0x8f, 0x98, 0x52, 0x0a, 0x5c, 0x5c, 0x32, 0x96, 0x8e, 0x95, 0x0e, 0x8a, 0x2c,
    0x5f, 0xe0, 0x6d, 0x6c, 0x38,
];

const AEAD_KEY_LEN: usize = 16;
const AEAD_IV_LEN: usize = 12;
const SECRET_LEN: usize = 32;

/// Encryption epochs, in coalescing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Epoch {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

pub const EPOCH_COUNT: usize = 4;

impl Epoch {
    pub fn index(self) -> usize {
        self as usize
    }

    /// The packet-number space this epoch shares (draft-12 collapse).
    pub fn space(self) -> SpaceId {
        match self {
            Epoch::Initial | Epoch::Handshake => SpaceId::Handshake,
            Epoch::ZeroRtt | Epoch::OneRtt => SpaceId::Application,
        }
    }

    pub const ALL: [Epoch; EPOCH_COUNT] =
        [Epoch::Initial, Epoch::ZeroRtt, Epoch::Handshake, Epoch::OneRtt];
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn qhkdf_info(label: &str, len: usize) -> Vec<u8> {
    let mut info = Vec::with_capacity(3 + 5 + label.len());
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push((5 + label.len()) as u8);
    info.extend_from_slice(b"QUIC ");
    info.extend_from_slice(label.as_bytes());
    info
}

fn expand_from_prk(prk: &hkdf::Prk, label: &str, len: usize) -> Result<Vec<u8>> {
    let info = qhkdf_info(label, len);
    let mut out = vec![0u8; len];
    prk.expand(&[&info], OkmLen(len))
        .and_then(|okm| okm.fill(&mut out))
        .map_err(|_| Error::Quic(QuicError::InternalError))?;
    Ok(out)
}

/// `QHKDF-Expand(secret, label, len)`: HKDF-Expand with the "QUIC " label
/// prefix (draft-12 Section 5.2.3).
pub(crate) fn qhkdf_expand(secret: &[u8], label: &str, len: usize) -> Result<Vec<u8>> {
    let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);
    expand_from_prk(&prk, label, len)
}

/// Keys for one direction of one epoch.
pub struct DirectionalKey {
    key: aead::LessSafeKey,
    iv: [u8; AEAD_IV_LEN],
}

impl DirectionalKey {
    /// Derive packet key and IV from a traffic secret.
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        let key_bytes = qhkdf_expand(secret, "key", AEAD_KEY_LEN)?;
        let iv_bytes = qhkdf_expand(secret, "iv", AEAD_IV_LEN)?;

        let unbound = aead::UnboundKey::new(&aead::AES_128_GCM, &key_bytes)
            .map_err(|_| Error::Quic(QuicError::InternalError))?;
        let mut iv = [0u8; AEAD_IV_LEN];
        iv.copy_from_slice(&iv_bytes);
        Ok(Self { key: aead::LessSafeKey::new(unbound), iv })
    }

    /// Nonce for a packet number: IV with the number XORed into the tail.
    fn nonce(&self, pn: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (i, byte) in pn.to_be_bytes().iter().enumerate() {
            nonce[AEAD_IV_LEN - 8 + i] ^= byte;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    /// Encrypt `payload` in place, appending the 16-byte tag.
    pub fn seal(&self, pn: u64, header: &[u8], payload: &mut Vec<u8>) -> Result<()> {
        self.key
            .seal_in_place_append_tag(self.nonce(pn), aead::Aad::from(header), payload)
            .map_err(|_| Error::Quic(QuicError::InternalError))
    }

    /// Decrypt a protected payload; returns the plaintext.
    pub fn open(&self, pn: u64, header: &[u8], mut ciphertext: Vec<u8>) -> Result<Vec<u8>> {
        let plain_len = self
            .key
            .open_in_place(self.nonce(pn), aead::Aad::from(header), &mut ciphertext)
            .map_err(|_| Error::Local(LocalError::DecryptionFailure))?
            .len();
        ciphertext.truncate(plain_len);
        Ok(ciphertext)
    }
}

/// Seal/open key pair for one epoch, from this endpoint's perspective.
pub struct KeyPair {
    pub seal: DirectionalKey,
    pub open: DirectionalKey,
}

impl KeyPair {
    /// Build from local (seal) and remote (open) traffic secrets.
    pub fn from_secrets(local: &[u8], remote: &[u8]) -> Result<Self> {
        Ok(Self {
            seal: DirectionalKey::from_secret(local)?,
            open: DirectionalKey::from_secret(remote)?,
        })
    }
}

/// Derive the initial-epoch key pair from the client's initial destination
/// connection ID.
pub fn initial_keys(dcid: &ConnectionId, side: Side) -> Result<KeyPair> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT);
    let prk = salt.extract(dcid.as_bytes());

    let client = expand_from_prk(&prk, "client hs", SECRET_LEN)?;
    let server = expand_from_prk(&prk, "server hs", SECRET_LEN)?;

    match side {
        Side::Client => KeyPair::from_secrets(&client, &server),
        Side::Server => KeyPair::from_secrets(&server, &client),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cid() -> ConnectionId {
        ConnectionId::from_slice(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]).unwrap()
    }

    #[test]
    fn test_epoch_space_mapping() {
        assert_eq!(Epoch::Initial.space(), SpaceId::Handshake);
        assert_eq!(Epoch::Handshake.space(), SpaceId::Handshake);
        assert_eq!(Epoch::ZeroRtt.space(), SpaceId::Application);
        assert_eq!(Epoch::OneRtt.space(), SpaceId::Application);
    }

    #[test]
    fn test_qhkdf_deterministic() {
        let secret = [0x42u8; 32];
        let a = qhkdf_expand(&secret, "key", 16).unwrap();
        let b = qhkdf_expand(&secret, "key", 16).unwrap();
        assert_eq!(a, b);
        let c = qhkdf_expand(&secret, "iv", 16).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_initial_seal_open_across_endpoints() {
        // Both sides derive from the client's initial destination CID and
        // must interoperate: client-sealed opens under the server's keys.
        let client = initial_keys(&test_cid(), Side::Client).unwrap();
        let server = initial_keys(&test_cid(), Side::Server).unwrap();

        let header = [0xFFu8, 0x00, 0x00, 0x0C];
        let mut payload = b"client initial payload".to_vec();
        client.seal.seal(0, &header, &mut payload).unwrap();
        assert_eq!(payload.len(), b"client initial payload".len() + TAG_LEN);

        let plain = server.open.open(0, &header, payload).unwrap();
        assert_eq!(plain, b"client initial payload");
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let client = initial_keys(&test_cid(), Side::Client).unwrap();
        let server = initial_keys(&test_cid(), Side::Server).unwrap();

        let header = [0xFDu8];
        let mut payload = b"payload".to_vec();
        client.seal.seal(7, &header, &mut payload).unwrap();
        payload[0] ^= 0x01;

        assert_eq!(
            server.open.open(7, &header, payload).err(),
            Some(Error::Local(LocalError::DecryptionFailure))
        );
    }

    #[test]
    fn test_open_rejects_wrong_header() {
        let client = initial_keys(&test_cid(), Side::Client).unwrap();
        let server = initial_keys(&test_cid(), Side::Server).unwrap();

        let mut payload = b"payload".to_vec();
        client.seal.seal(7, &[0xFD], &mut payload).unwrap();
        assert!(server.open.open(7, &[0xFC], payload).is_err());
    }

    #[test]
    fn test_open_rejects_wrong_packet_number() {
        let client = initial_keys(&test_cid(), Side::Client).unwrap();
        let server = initial_keys(&test_cid(), Side::Server).unwrap();

        let mut payload = b"payload".to_vec();
        client.seal.seal(7, &[0xFD], &mut payload).unwrap();
        assert!(server.open.open(8, &[0xFD], payload).is_err());
    }

    #[test]
    fn test_different_cid_different_keys() {
        let a = initial_keys(&test_cid(), Side::Client).unwrap();
        let b = initial_keys(&ConnectionId::from_slice(&[1, 2, 3, 4]).unwrap(), Side::Client)
            .unwrap();

        let mut payload = b"payload".to_vec();
        a.seal.seal(0, &[0xFF], &mut payload).unwrap();
        assert!(b.open.open(0, &[0xFF], payload).is_err());
    }

    #[test]
    fn test_keys_from_secrets_roundtrip() {
        let local = [0x11u8; 32];
        let remote = [0x22u8; 32];
        let ours = KeyPair::from_secrets(&local, &remote).unwrap();
        let theirs = KeyPair::from_secrets(&remote, &local).unwrap();

        let mut payload = b"one rtt data".to_vec();
        ours.seal.seal(42, &[0x30], &mut payload).unwrap();
        let plain = theirs.open.open(42, &[0x30], payload).unwrap();
        assert_eq!(plain, b"one rtt data");
    }
}
