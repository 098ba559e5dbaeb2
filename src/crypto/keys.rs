use ring::aead;
use ring::hkdf::{self, KeyType, Prk, Salt, HKDF_SHA256};

use crate::cid::ConnectionId;
use crate::result::{QuicError, QuicResult};

/// Version 1 Initial salt (RFC 9001 Section 5.2).
pub const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

pub const SECRET_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherSuite {
    #[default]
    Aes128Gcm,
    ChaCha20Poly1305,
}

impl CipherSuite {
    pub fn key_len(self) -> usize {
        match self {
            CipherSuite::Aes128Gcm => 16,
            CipherSuite::ChaCha20Poly1305 => 32,
        }
    }

    pub fn hp_key_len(self) -> usize {
        match self {
            CipherSuite::Aes128Gcm => 16,
            CipherSuite::ChaCha20Poly1305 => 32,
        }
    }

    fn aead_algorithm(self) -> &'static aead::Algorithm {
        match self {
            CipherSuite::Aes128Gcm => &aead::AES_128_GCM,
            CipherSuite::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    fn hp_algorithm(self) -> &'static aead::quic::Algorithm {
        match self {
            CipherSuite::Aes128Gcm => &aead::quic::AES_128,
            CipherSuite::ChaCha20Poly1305 => &aead::quic::CHACHA20,
        }
    }
}

struct OkmLen(usize);

impl KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label (RFC 8446 Section 7.1) with the "tls13 " prefix, as
/// QUIC reuses it (RFC 9001 Section 5.1).
pub fn hkdf_expand_label(prk: &Prk, label: &[u8], out: &mut [u8]) -> QuicResult<()> {
    let label_full_len = b"tls13 ".len() + label.len();
    let info: [&[u8]; 5] = [
        &(out.len() as u16).to_be_bytes(),
        &[label_full_len as u8],
        b"tls13 ",
        label,
        &[0u8], // empty context
    ];
    let okm = prk
        .expand(&info, OkmLen(out.len()))
        .map_err(|_| QuicError::Crypto("hkdf expand failed"))?;
    okm.fill(out)
        .map_err(|_| QuicError::Crypto("hkdf fill failed"))
}

fn prk_from_secret(secret: &[u8; SECRET_LEN]) -> Prk {
    Prk::new_less_safe(HKDF_SHA256, secret)
}

/// One direction's packet-protection material: the 32-byte traffic secret
/// plus the AEAD key, IV and header-protection key derived from it.
#[derive(Clone)]
pub struct Keys {
    suite: CipherSuite,
    secret: [u8; SECRET_LEN],
    key: Vec<u8>,
    iv: [u8; IV_LEN],
    hp_key: Vec<u8>,
}

impl Keys {
    pub fn zeroed(suite: CipherSuite) -> Self {
        Self {
            suite,
            secret: [0; SECRET_LEN],
            key: vec![0; suite.key_len()],
            iv: [0; IV_LEN],
            hp_key: vec![0; suite.hp_key_len()],
        }
    }

    /// Derive "quic key" / "quic iv" / "quic hp" from a traffic secret
    /// (RFC 9001 Section 5.1).
    pub fn from_secret(suite: CipherSuite, secret: [u8; SECRET_LEN]) -> QuicResult<Self> {
        let prk = prk_from_secret(&secret);
        let mut key = vec![0; suite.key_len()];
        let mut iv = [0; IV_LEN];
        let mut hp_key = vec![0; suite.hp_key_len()];
        hkdf_expand_label(&prk, b"quic key", &mut key)?;
        hkdf_expand_label(&prk, b"quic iv", &mut iv)?;
        hkdf_expand_label(&prk, b"quic hp", &mut hp_key)?;
        Ok(Self {
            suite,
            secret,
            key,
            iv,
            hp_key,
        })
    }

    /// A key is usable once any key byte is non-zero.
    pub fn is_valid(&self) -> bool {
        self.key.iter().any(|&b| b != 0)
    }

    /// Zeroise all material on discard.
    pub fn clear(&mut self) {
        self.secret.fill(0);
        self.key.fill(0);
        self.iv.fill(0);
        self.hp_key.fill(0);
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn secret(&self) -> &[u8; SECRET_LEN] {
        &self.secret
    }

    /// Next-generation keys for a key update ("quic ku", RFC 9001
    /// Section 6).
    pub fn next_generation(&self) -> QuicResult<Self> {
        let prk = prk_from_secret(&self.secret);
        let mut next_secret = [0; SECRET_LEN];
        hkdf_expand_label(&prk, b"quic ku", &mut next_secret)?;
        Self::from_secret(self.suite, next_secret)
    }

    /// AEAD nonce for a packet number: the IV XORed with the big-endian
    /// packet number, zero-extended on the left.
    pub fn nonce_for(&self, pn: u64) -> [u8; IV_LEN] {
        let mut nonce = self.iv;
        for (i, byte) in pn.to_be_bytes().iter().enumerate() {
            nonce[IV_LEN - 8 + i] ^= byte;
        }
        nonce
    }

    pub fn aead_key(&self) -> QuicResult<aead::LessSafeKey> {
        let unbound = aead::UnboundKey::new(self.suite.aead_algorithm(), &self.key)
            .map_err(|_| QuicError::Crypto("bad aead key length"))?;
        Ok(aead::LessSafeKey::new(unbound))
    }

    /// 5-byte header-protection mask from a 16-byte ciphertext sample.
    pub fn hp_mask(&self, sample: &[u8]) -> QuicResult<[u8; 5]> {
        let key = aead::quic::HeaderProtectionKey::new(self.suite.hp_algorithm(), &self.hp_key)
            .map_err(|_| QuicError::Crypto("bad header protection key"))?;
        key.new_mask(sample)
            .map_err(|_| QuicError::Crypto("header protection sample"))
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        f.debug_struct("Keys")
            .field("suite", &self.suite)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Read/write keys for one encryption level.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub read: Keys,
    pub write: Keys,
}

impl KeyPair {
    pub fn is_valid(&self) -> bool {
        self.read.is_valid() && self.write.is_valid()
    }

    pub fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Initial keys from the client's destination CID (RFC 9001 Section 5.2).
/// Both directions derive from the same extract, with "client in" and
/// "server in" labels; which one is read vs write depends on the side.
pub fn initial_keys(dcid: &ConnectionId, side: Side) -> QuicResult<KeyPair> {
    let initial_secret = Salt::new(HKDF_SHA256, &INITIAL_SALT_V1).extract(dcid.as_slice());

    let mut client_secret = [0; SECRET_LEN];
    let mut server_secret = [0; SECRET_LEN];
    hkdf_expand_label(&initial_secret, b"client in", &mut client_secret)?;
    hkdf_expand_label(&initial_secret, b"server in", &mut server_secret)?;

    let client = Keys::from_secret(CipherSuite::Aes128Gcm, client_secret)?;
    let server = Keys::from_secret(CipherSuite::Aes128Gcm, server_secret)?;

    Ok(match side {
        Side::Client => KeyPair {
            read: server,
            write: client,
        },
        Side::Server => KeyPair {
            read: client,
            write: server,
        },
    })
}
