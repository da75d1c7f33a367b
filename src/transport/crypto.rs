//! Packet protection seals and the RFC 9001 key schedule.

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hkdf;
use thiserror::Error;
use tracing::trace;

use super::cid::ConnectionId;

/// AEAD authentication tag length shared by all supported suites.
pub const TAG_LEN: usize = 16;

/// Header protection sample length (RFC 9001 section 5.4.2).
pub const SAMPLE_LEN: usize = 16;

/// Salt for version 1 initial secrets (RFC 9001 section 5.2).
const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Errors from key derivation or packet sealing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// HKDF expansion produced the wrong amount of key material.
    #[error("key derivation failed")]
    KeyDerivation,
    /// AEAD seal operation failed.
    #[error("packet sealing failed")]
    SealFailed,
    /// AEAD open operation failed (tampered or foreign packet).
    #[error("packet authentication failed")]
    OpenFailed,
    /// Header protection mask could not be computed.
    #[error("header protection failed")]
    HeaderProtectionFailed,
}

/// AEAD suites negotiated by the TLS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// TLS_AES_128_GCM_SHA256; mandatory for Initial packets.
    Aes128Gcm,
    /// TLS_AES_256_GCM_SHA384.
    Aes256Gcm,
    /// TLS_CHACHA20_POLY1305_SHA256.
    ChaCha20Poly1305,
}

impl CipherSuite {
    fn aead(self) -> &'static aead::Algorithm {
        match self {
            Self::Aes128Gcm => &aead::AES_128_GCM,
            Self::Aes256Gcm => &aead::AES_256_GCM,
            Self::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    fn header_protection(self) -> &'static aead::quic::Algorithm {
        match self {
            Self::Aes128Gcm => &aead::quic::AES_128,
            Self::Aes256Gcm => &aead::quic::AES_256,
            Self::ChaCha20Poly1305 => &aead::quic::CHACHA20,
        }
    }

    fn hkdf(self) -> hkdf::Algorithm {
        match self {
            Self::Aes128Gcm | Self::ChaCha20Poly1305 => hkdf::HKDF_SHA256,
            Self::Aes256Gcm => hkdf::HKDF_SHA384,
        }
    }

    /// AEAD key length in bytes.
    #[must_use]
    pub fn key_len(self) -> usize {
        self.aead().key_len()
    }
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label from TLS 1.3 (RFC 8446 section 7.1) with an empty
/// context, as used by the QUIC key schedule.
pub fn hkdf_expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    const PREFIX: &[u8] = b"tls13 ";
    let out_len = u16::try_from(out.len()).map_err(|_| CryptoError::KeyDerivation)?;
    let label_len = u8::try_from(PREFIX.len() + label.len()).map_err(|_| CryptoError::KeyDerivation)?;
    let info: [&[u8]; 5] = [&out_len.to_be_bytes(), &[label_len], PREFIX, label, &[0u8]];
    prk.expand(&info, OkmLen(out.len()))
        .and_then(|okm| okm.fill(out))
        .map_err(|_| CryptoError::KeyDerivation)
}

/// Directional packet protection state for one encryption level.
///
/// Immutable once installed; discarded together with its space.
pub struct Seal {
    key: LessSafeKey,
    iv: [u8; 12],
    hp: aead::quic::HeaderProtectionKey,
    suite: CipherSuite,
}

impl std::fmt::Debug for Seal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seal").field("suite", &self.suite).finish()
    }
}

impl Seal {
    /// Derive key, IV, and header-protection key from a TLS secret
    /// (RFC 9001 section 5.1).
    pub fn from_secret(suite: CipherSuite, secret: &[u8]) -> Result<Self, CryptoError> {
        let prk = hkdf::Prk::new_less_safe(suite.hkdf(), secret);

        let mut key = [0u8; 32];
        let key = &mut key[..suite.key_len()];
        hkdf_expand_label(&prk, b"quic key", key)?;

        let mut iv = [0u8; 12];
        hkdf_expand_label(&prk, b"quic iv", &mut iv)?;

        let mut hp = [0u8; 32];
        let hp = &mut hp[..suite.key_len()];
        hkdf_expand_label(&prk, b"quic hp", hp)?;

        trace!(?suite, "derived packet protection seal");
        Ok(Self {
            key: LessSafeKey::new(
                UnboundKey::new(suite.aead(), key).map_err(|_| CryptoError::KeyDerivation)?,
            ),
            iv,
            hp: aead::quic::HeaderProtectionKey::new(suite.header_protection(), hp)
                .map_err(|_| CryptoError::KeyDerivation)?,
            suite,
        })
    }

    /// The negotiated suite for this seal.
    #[must_use]
    pub const fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Nonce = IV XOR the packet number, right-aligned big-endian.
    fn nonce(&self, packet_number: u64) -> Nonce {
        let mut nonce = self.iv;
        for (slot, byte) in nonce[4..].iter_mut().zip(packet_number.to_be_bytes()) {
            *slot ^= byte;
        }
        Nonce::assume_unique_for_key(nonce)
    }

    /// Encrypt `in_out` in place with `header` as associated data and
    /// write the tag into `tag_out`.
    pub fn seal_in_place(
        &self,
        packet_number: u64,
        header: &[u8],
        in_out: &mut [u8],
        tag_out: &mut [u8],
    ) -> Result<(), CryptoError> {
        let tag = self
            .key
            .seal_in_place_separate_tag(self.nonce(packet_number), Aad::from(header), in_out)
            .map_err(|_| CryptoError::SealFailed)?;
        if tag_out.len() != TAG_LEN {
            return Err(CryptoError::SealFailed);
        }
        tag_out.copy_from_slice(tag.as_ref());
        Ok(())
    }

    /// Decrypt `in_out` (ciphertext followed by tag) in place, returning
    /// the plaintext length. Failure means the packet is dropped by the
    /// caller, never surfaced as a connection error.
    pub fn open_in_place(
        &self,
        packet_number: u64,
        header: &[u8],
        in_out: &mut [u8],
    ) -> Result<usize, CryptoError> {
        let plain = self
            .key
            .open_in_place(self.nonce(packet_number), Aad::from(header), in_out)
            .map_err(|_| CryptoError::OpenFailed)?;
        Ok(plain.len())
    }

    /// Five-byte header protection mask for a sixteen-byte ciphertext
    /// sample.
    pub fn header_mask(&self, sample: &[u8]) -> Result<[u8; 5], CryptoError> {
        self.hp
            .new_mask(sample)
            .map_err(|_| CryptoError::HeaderProtectionFailed)
    }
}

/// Client and server initial secrets derived from the first Initial
/// packet's destination connection ID (RFC 9001 section 5.2).
#[derive(Debug)]
pub struct InitialSecrets {
    /// Secret protecting client-to-server Initial packets.
    pub client: [u8; 32],
    /// Secret protecting server-to-client Initial packets.
    pub server: [u8; 32],
}

impl InitialSecrets {
    /// Derive both directions from the client's destination CID.
    pub fn derive(dcid: &ConnectionId) -> Result<Self, CryptoError> {
        let initial = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT_V1).extract(dcid.as_slice());

        let mut client = [0u8; 32];
        let mut server = [0u8; 32];
        hkdf_expand_label(&initial, b"client in", &mut client)?;
        hkdf_expand_label(&initial, b"server in", &mut server)?;
        Ok(Self { client, server })
    }

    /// Build the seal pair for the given role: `(write, read)`.
    pub fn seals(&self, is_client: bool) -> Result<(Seal, Seal), CryptoError> {
        let (write_secret, read_secret) = if is_client {
            (&self.client, &self.server)
        } else {
            (&self.server, &self.client)
        };
        Ok((
            Seal::from_secret(CipherSuite::Aes128Gcm, write_secret)?,
            Seal::from_secret(CipherSuite::Aes128Gcm, read_secret)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn rfc_dcid() -> ConnectionId {
        ConnectionId::from_slice(&hex!("8394c8f03e515708")).unwrap()
    }

    #[test]
    fn initial_secrets_match_rfc9001_appendix_a() {
        let secrets = InitialSecrets::derive(&rfc_dcid()).unwrap();
        assert_eq!(
            secrets.client,
            hex!("c00cf151ca5be075ed0ebfb5c80323c42d6b7db67881289af4008f1f6c357aea")
        );
        assert_eq!(
            secrets.server,
            hex!("3c199828fd139efd216c155ad844cc81fb82fa8d7446fa7d78be803acdda951b")
        );
    }

    #[test]
    fn client_initial_key_material_matches_rfc9001() {
        let secrets = InitialSecrets::derive(&rfc_dcid()).unwrap();
        let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &secrets.client);

        let mut key = [0u8; 16];
        hkdf_expand_label(&prk, b"quic key", &mut key).unwrap();
        assert_eq!(key, hex!("1f369613dd76d5467730efcbe3b1a22d"));

        let mut iv = [0u8; 12];
        hkdf_expand_label(&prk, b"quic iv", &mut iv).unwrap();
        assert_eq!(iv, hex!("fa044b2f42a3fd3b46fb255c"));

        let mut hp = [0u8; 16];
        hkdf_expand_label(&prk, b"quic hp", &mut hp).unwrap();
        assert_eq!(hp, hex!("9f50449e04a0e810283a1e9933adedd2"));
    }

    #[test]
    fn server_initial_key_material_matches_rfc9001() {
        let secrets = InitialSecrets::derive(&rfc_dcid()).unwrap();
        let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &secrets.server);

        let mut key = [0u8; 16];
        hkdf_expand_label(&prk, b"quic key", &mut key).unwrap();
        assert_eq!(key, hex!("cf3a5331653c364c88f0f379b6067e37"));

        let mut iv = [0u8; 12];
        hkdf_expand_label(&prk, b"quic iv", &mut iv).unwrap();
        assert_eq!(iv, hex!("0ac1493ca1905853b0bba03e"));

        let mut hp = [0u8; 16];
        hkdf_expand_label(&prk, b"quic hp", &mut hp).unwrap();
        assert_eq!(hp, hex!("c206b8d9b9f0f37644430b490eeaa314"));
    }

    #[test]
    fn seal_and_open_roundtrip() {
        let secret = [0x42u8; 32];
        let seal = Seal::from_secret(CipherSuite::Aes128Gcm, &secret).unwrap();
        let header = b"hdr";
        let mut payload = b"some plaintext".to_vec();
        let mut tag = [0u8; TAG_LEN];
        seal.seal_in_place(7, header, &mut payload, &mut tag).unwrap();

        let mut combined = payload.clone();
        combined.extend_from_slice(&tag);
        let plain_len = seal.open_in_place(7, header, &mut combined).unwrap();
        assert_eq!(&combined[..plain_len], b"some plaintext");
    }

    #[test]
    fn tampering_defeats_open() {
        let secret = [0x42u8; 32];
        let seal = Seal::from_secret(CipherSuite::ChaCha20Poly1305, &secret).unwrap();
        let header = [0xc3u8, 0x00];
        let mut payload = b"payload".to_vec();
        let mut tag = [0u8; TAG_LEN];
        seal.seal_in_place(1, &header, &mut payload, &mut tag).unwrap();

        let mut combined = payload.clone();
        combined.extend_from_slice(&tag);

        // Flip one ciphertext bit.
        let mut tampered = combined.clone();
        tampered[0] ^= 0x01;
        assert_eq!(seal.open_in_place(1, &header, &mut tampered), Err(CryptoError::OpenFailed));

        // Flip one tag bit.
        let mut tampered = combined.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x80;
        assert_eq!(seal.open_in_place(1, &header, &mut tampered), Err(CryptoError::OpenFailed));

        // Wrong header (associated data).
        let mut tampered = combined.clone();
        assert_eq!(
            seal.open_in_place(1, &[0xc3, 0x01], &mut tampered),
            Err(CryptoError::OpenFailed)
        );

        // Wrong packet number changes the nonce.
        assert_eq!(seal.open_in_place(2, &header, &mut combined), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn header_mask_is_deterministic_and_five_bytes() {
        let seal = Seal::from_secret(CipherSuite::Aes128Gcm, &[0x11; 32]).unwrap();
        let sample = [0xabu8; SAMPLE_LEN];
        let first = seal.header_mask(&sample).unwrap();
        let second = seal.header_mask(&sample).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, [0u8; 5]);
    }
}
