use bytes::BytesMut;
use ring::{aead, hkdf, hmac};

use crate::packet::ConnectionId;
use crate::spaces::SpaceId;
use crate::{Side, AEAD_TAG_SIZE, RESET_TOKEN_SIZE};

/// RFC 9001 §5.2 initial salt for QUIC version 1
const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// RFC 9001 §5.8 retry integrity key and nonce for QUIC version 1
const RETRY_INTEGRITY_KEY_V1: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];
const RETRY_INTEGRITY_NONCE_V1: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

/// The exponent we apply to ACK delay fields we emit (RFC 9000 default)
pub const ACK_DELAY_EXPONENT: u8 = 3;

/// TLS encryption levels; 0-RTT and 1-RTT share the application number space
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EncLevel {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

impl EncLevel {
    pub fn space(self) -> SpaceId {
        match self {
            EncLevel::Initial => SpaceId::Initial,
            EncLevel::Handshake => SpaceId::Handshake,
            _ => SpaceId::Data,
        }
    }

    pub fn iter() -> impl Iterator<Item = EncLevel> {
        [
            EncLevel::Initial,
            EncLevel::ZeroRtt,
            EncLevel::Handshake,
            EncLevel::OneRtt,
        ]
        .iter()
        .cloned()
    }
}

#[derive(Debug, Fail, Copy, Clone, Eq, PartialEq)]
pub enum CryptoError {
    #[fail(display = "cipher suite not supported for QUIC")]
    UnsupportedSuite,
    #[fail(display = "keys for this level are not installed")]
    KeysUnavailable,
    #[fail(display = "packet failed AEAD verification")]
    DecryptFailed,
}

/// AEAD suites usable for QUIC v1 packet protection
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Cipher {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Cipher {
    /// Map a TLS 1.3 cipher suite identifier; AES-CCM has no ring backend and is refused
    pub fn from_tls_id(id: u16) -> Result<Cipher, CryptoError> {
        match id {
            0x1301 => Ok(Cipher::Aes128Gcm),
            0x1302 => Ok(Cipher::Aes256Gcm),
            0x1303 => Ok(Cipher::ChaCha20Poly1305),
            _ => Err(CryptoError::UnsupportedSuite),
        }
    }

    fn aead_alg(self) -> &'static aead::Algorithm {
        match self {
            Cipher::Aes128Gcm => &aead::AES_128_GCM,
            Cipher::Aes256Gcm => &aead::AES_256_GCM,
            Cipher::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    fn hp_alg(self) -> &'static aead::quic::Algorithm {
        match self {
            Cipher::Aes128Gcm => &aead::quic::AES_128,
            Cipher::Aes256Gcm => &aead::quic::AES_256,
            Cipher::ChaCha20Poly1305 => &aead::quic::CHACHA20,
        }
    }

    fn hkdf_alg(self) -> hkdf::Algorithm {
        match self {
            Cipher::Aes256Gcm => hkdf::HKDF_SHA384,
            _ => hkdf::HKDF_SHA256,
        }
    }

    fn key_len(self) -> usize {
        match self {
            Cipher::Aes128Gcm => 16,
            _ => 32,
        }
    }

    fn hash_len(self) -> usize {
        match self {
            Cipher::Aes256Gcm => 48,
            _ => 32,
        }
    }
}

/// A raw traffic secret for one direction of one encryption level
///
/// Packet protection keys are derived on demand; the secret itself is retained only where a
/// later derivation (key update) needs it.
#[derive(Clone)]
pub struct Secret {
    cipher: Cipher,
    bytes: Vec<u8>,
}

impl Secret {
    pub fn new(cipher: Cipher, bytes: &[u8]) -> Self {
        Secret {
            cipher,
            bytes: bytes.into(),
        }
    }

    /// Derive the Initial secret for one direction from the client's first Destination CID
    pub fn initial(dst_cid: &ConnectionId, side: Side, write: bool) -> Self {
        let initial = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT_V1).extract(dst_cid);
        let label: &[u8] = if side.is_client() == write {
            b"client in"
        } else {
            b"server in"
        };
        let mut bytes = vec![0; 32];
        hkdf_expand_label(&initial, label, &mut bytes);
        Secret {
            cipher: Cipher::Aes128Gcm,
            bytes,
        }
    }

    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    /// Derive packet protection keys
    pub fn keys(&self) -> Result<Keys, CryptoError> {
        let prk = hkdf::Prk::new_less_safe(self.cipher.hkdf_alg(), &self.bytes);
        let mut key = vec![0; self.cipher.key_len()];
        hkdf_expand_label(&prk, b"quic key", &mut key);
        let mut iv = [0; 12];
        hkdf_expand_label(&prk, b"quic iv", &mut iv);
        let mut hp = vec![0; self.cipher.key_len()];
        hkdf_expand_label(&prk, b"quic hp", &mut hp);
        let key = aead::LessSafeKey::new(
            aead::UnboundKey::new(self.cipher.aead_alg(), &key)
                .map_err(|_| CryptoError::UnsupportedSuite)?,
        );
        let header = HeaderKey(
            aead::quic::HeaderProtectionKey::new(self.cipher.hp_alg(), &hp)
                .map_err(|_| CryptoError::UnsupportedSuite)?,
        );
        Ok(Keys { key, iv, header })
    }

    /// The next-generation secret for a key update, per the "quic ku" label
    pub fn update(&self) -> Secret {
        let prk = hkdf::Prk::new_less_safe(self.cipher.hkdf_alg(), &self.bytes);
        let mut bytes = vec![0; self.cipher.hash_len()];
        hkdf_expand_label(&prk, b"quic ku", &mut bytes);
        Secret {
            cipher: self.cipher,
            bytes,
        }
    }
}

/// HKDF-Expand-Label from TLS 1.3, with an empty context
fn hkdf_expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    const BASE: &[u8] = b"tls13 ";
    let mut info = Vec::with_capacity(2 + 1 + BASE.len() + label.len() + 1);
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((BASE.len() + label.len()) as u8);
    info.extend_from_slice(BASE);
    info.extend_from_slice(label);
    info.push(0);
    prk.expand(&[&info[..]], OkmLen(out.len()))
        .expect("expand length out of range")
        .fill(out)
        .expect("fill length mismatch");
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Header-protection mask generator
pub struct HeaderKey(aead::quic::HeaderProtectionKey);

impl HeaderKey {
    pub fn sample_size(&self) -> usize {
        self.0.algorithm().sample_len()
    }

    pub fn mask(&self, sample: &[u8]) -> [u8; 5] {
        self.0.new_mask(sample).expect("invalid sample length")
    }
}

/// Derived packet protection state for one direction of one level
pub struct Keys {
    key: aead::LessSafeKey,
    iv: [u8; 12],
    header: HeaderKey,
}

impl Keys {
    pub fn header_key(&self) -> &HeaderKey {
        &self.header
    }

    pub fn tag_len(&self) -> usize {
        AEAD_TAG_SIZE
    }

    fn nonce(&self, number: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (i, b) in number.to_be_bytes().iter().enumerate() {
            nonce[4 + i] ^= b;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    /// Seal `buf[header_len..]` in place, appending the tag; the header is associated data
    pub fn encrypt(&self, number: u64, buf: &mut Vec<u8>, header_len: usize) {
        let tag = {
            let (header, body) = buf.split_at_mut(header_len);
            self.key
                .seal_in_place_separate_tag(self.nonce(number), aead::Aad::from(&header[..]), body)
                .expect("packet too large to seal")
        };
        buf.extend_from_slice(tag.as_ref());
    }

    /// Verify and strip the tag; on success `payload` holds plaintext
    pub fn decrypt(
        &self,
        number: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        let plain_len = {
            let plain = self
                .key
                .open_in_place(self.nonce(number), aead::Aad::from(header), &mut payload[..])
                .map_err(|_| CryptoError::DecryptFailed)?;
            plain.len()
        };
        payload.truncate(plain_len);
        Ok(())
    }
}

/// Compute the retry integrity tag over the pseudo-packet (RFC 9001 §5.8); version 1 only
pub fn retry_tag(orig_dst_cid: &ConnectionId, packet: &[u8]) -> [u8; 16] {
    let mut pseudo = Vec::with_capacity(1 + orig_dst_cid.len() + packet.len());
    pseudo.push(orig_dst_cid.len() as u8);
    pseudo.extend_from_slice(orig_dst_cid);
    pseudo.extend_from_slice(packet);
    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_128_GCM, &RETRY_INTEGRITY_KEY_V1).unwrap(),
    );
    let nonce = aead::Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE_V1);
    let mut empty = [0u8; 0];
    let tag = key
        .seal_in_place_separate_tag(nonce, aead::Aad::from(&pseudo), &mut empty[..])
        .unwrap();
    let mut out = [0; 16];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Verify a received Retry packet's trailing integrity tag
pub fn verify_retry(orig_dst_cid: &ConnectionId, packet: &[u8]) -> bool {
    if packet.len() < 16 {
        return false;
    }
    let (body, tag) = packet.split_at(packet.len() - 16);
    constant_time_eq::constant_time_eq(&retry_tag(orig_dst_cid, body), tag)
}

/// Stateless reset token for a connection ID, derived from a long-lived endpoint key
pub fn reset_token_for(key: &hmac::Key, id: &ConnectionId) -> [u8; RESET_TOKEN_SIZE] {
    let signature = hmac::sign(key, id);
    let mut out = [0; RESET_TOKEN_SIZE];
    out.copy_from_slice(&signature.as_ref()[..RESET_TOKEN_SIZE]);
    out
}

/// An event surfaced by the TLS stack after `progress`
pub enum TlsEvent {
    /// Handshake bytes to transmit in CRYPTO frames at `level`
    HandshakeData { level: EncLevel, data: Vec<u8> },
    /// A read secret was exported for `level`
    ReadSecret { level: EncLevel, secret: Secret },
    /// A write secret was exported for `level`
    WriteSecret { level: EncLevel, secret: Secret },
    /// The peer's transport parameters extension arrived
    TransportParameters(Vec<u8>),
    /// The TLS handshake has completed
    HandshakeComplete,
    /// A fatal TLS alert must be surfaced as a CRYPTO_ERROR
    Alert(u8),
}

/// The TLS stack as consumed by the connection core
///
/// Implementations wrap a real TLS library; the core only moves handshake bytes and installs
/// exported secrets. Local transport parameters are supplied when the session is created.
pub trait TlsSession: Send {
    /// Feed contiguous CRYPTO stream bytes received at `level`
    fn provide_data(&mut self, level: EncLevel, data: &[u8]);
    /// Advance the handshake; results are surfaced through `poll_event`
    fn progress(&mut self);
    /// Drain one pending event
    fn poll_event(&mut self) -> Option<TlsEvent>;
    fn is_handshaking(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_dcid() -> ConnectionId {
        ConnectionId::new(&hex!("8394c8f03e515708"))
    }

    #[test]
    fn initial_secrets() {
        // RFC 9001 Appendix A.1
        let client = Secret::initial(&client_dcid(), Side::Client, true);
        assert_eq!(
            client.bytes,
            hex!("c00cf151ca5be075ed0ebfb5c80323c42d6b7db67881289af4008f1f6c357aea")
        );
        let server = Secret::initial(&client_dcid(), Side::Client, false);
        assert_eq!(
            server.bytes,
            hex!("3c199828fd139efd216c155ad844cc81fb82fa8dc446fa7d78be803acdda951b")
        );
        // The same secrets viewed from the server side
        let server_write = Secret::initial(&client_dcid(), Side::Server, true);
        assert_eq!(server_write.bytes, server.bytes);
    }

    #[test]
    fn initial_key_material() {
        // RFC 9001 Appendix A.1 derived client keys
        let prk = hkdf::Prk::new_less_safe(
            hkdf::HKDF_SHA256,
            &hex!("c00cf151ca5be075ed0ebfb5c80323c42d6b7db67881289af4008f1f6c357aea"),
        );
        let mut key = [0; 16];
        hkdf_expand_label(&prk, b"quic key", &mut key);
        assert_eq!(key, hex!("1f369613dd76d5467730efcbe3b1a22d"));
        let mut iv = [0; 12];
        hkdf_expand_label(&prk, b"quic iv", &mut iv);
        assert_eq!(iv, hex!("fa044b2f42a3fd3b46fb255c"));
        let mut hp = [0; 16];
        hkdf_expand_label(&prk, b"quic hp", &mut hp);
        assert_eq!(hp, hex!("9f50449e04a0e810283a1e9933adedd2"));
    }

    #[test]
    fn aead_roundtrip_and_tamper() {
        let secret = Secret::initial(&client_dcid(), Side::Client, true);
        let keys = secret.keys().unwrap();
        let header = b"fake header".to_vec();
        let mut buf = header.clone();
        buf.extend_from_slice(b"the plaintext payload");
        keys.encrypt(42, &mut buf, header.len());
        assert_eq!(buf.len(), header.len() + 21 + AEAD_TAG_SIZE);

        let mut payload = BytesMut::from(&buf[header.len()..]);
        keys.decrypt(42, &header, &mut payload).unwrap();
        assert_eq!(&payload[..], b"the plaintext payload");

        // Bit flip in ciphertext
        let mut payload = BytesMut::from(&buf[header.len()..]);
        payload[0] ^= 1;
        assert_eq!(
            keys.decrypt(42, &header, &mut payload),
            Err(CryptoError::DecryptFailed)
        );
        // Bit flip in associated data
        let mut payload = BytesMut::from(&buf[header.len()..]);
        let mut bad_header = header.clone();
        bad_header[0] ^= 1;
        assert_eq!(
            keys.decrypt(42, &bad_header, &mut payload),
            Err(CryptoError::DecryptFailed)
        );
        // Wrong packet number changes the nonce
        let mut payload = BytesMut::from(&buf[header.len()..]);
        assert_eq!(
            keys.decrypt(43, &header, &mut payload),
            Err(CryptoError::DecryptFailed)
        );
    }

    #[test]
    fn retry_integrity_vector() {
        // RFC 9001 Appendix A.4
        let packet = hex!("ff000000010008f067a5502a4262b5746f6b656e04a265ba2eff4d829058fb3f0f2496ba");
        assert!(verify_retry(&client_dcid(), &packet));
        let tag = retry_tag(&client_dcid(), &packet[..packet.len() - 16]);
        assert_eq!(tag, hex!("04a265ba2eff4d829058fb3f0f2496ba"));
        // Any corruption invalidates the tag
        let mut bad = packet;
        bad[10] ^= 1;
        assert!(!verify_retry(&client_dcid(), &bad));
    }

    #[test]
    fn key_update_is_deterministic_and_fresh() {
        let secret = Secret::new(Cipher::Aes128Gcm, &[0x17; 32]);
        let next = secret.update();
        assert_ne!(secret.bytes, next.bytes);
        assert_eq!(next.bytes, secret.update().bytes);
        assert_eq!(next.bytes.len(), 32);
        // Updates chain
        assert_ne!(next.update().bytes, next.bytes);
    }

    #[test]
    fn unsupported_suite() {
        assert_eq!(Cipher::from_tls_id(0x1301), Ok(Cipher::Aes128Gcm));
        assert_eq!(Cipher::from_tls_id(0x1302), Ok(Cipher::Aes256Gcm));
        assert_eq!(Cipher::from_tls_id(0x1303), Ok(Cipher::ChaCha20Poly1305));
        // AES-128-CCM
        assert_eq!(Cipher::from_tls_id(0x1304), Err(CryptoError::UnsupportedSuite));
    }

    #[test]
    fn reset_tokens_differ_by_cid() {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &[0xab; 64]);
        let a = reset_token_for(&key, &ConnectionId::new(&[1; 8]));
        let b = reset_token_for(&key, &ConnectionId::new(&[2; 8]));
        assert_ne!(a, b);
        assert_eq!(a, reset_token_for(&key, &ConnectionId::new(&[1; 8])));
    }
}
