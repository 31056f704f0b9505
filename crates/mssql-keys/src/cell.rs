//! AEAD_AES_256_CBC_HMAC_SHA_256 cell cipher.
//!
//! Parameter values travel encrypted under this scheme when the describe
//! round trip stamps cipher metadata onto them, and returned output
//! parameters come back the same way. Encrypt-then-MAC layout:
//!
//! ```text
//! version(1) | HMAC-SHA256(32) | IV(16) | AES-256-CBC ciphertext
//! ```
//!
//! Three sub-keys are derived from the column encryption key with
//! HMAC-SHA256 over fixed labels: a cipher key, a MAC key, and an IV key.
//! Deterministic encryption derives the IV from the plaintext (same input,
//! same ciphertext — equality predicates keep working); randomized
//! encryption draws a fresh random IV per cell.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::{KeyError, Result};

/// The only cipher algorithm id the engine supports.
pub const CELL_CIPHER_ALGORITHM_ID: u8 = 2;

const FORMAT_VERSION: u8 = 0x01;
const BLOCK_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const MAC_SIZE: usize = 32;
const IV_SIZE: usize = 16;
const MIN_CELL_SIZE: usize = 1 + MAC_SIZE + IV_SIZE + BLOCK_SIZE;

const CIPHER_KEY_LABEL: &[u8] = b"Microsoft SQL Server cell encryption key";
const MAC_KEY_LABEL: &[u8] = b"Microsoft SQL Server cell MAC key";
const IV_KEY_LABEL: &[u8] = b"Microsoft SQL Server cell IV key";
const ALGORITHM_LABEL: &[u8] = b"AEAD_AES_256_CBC_HMAC_SHA_256";

type HmacSha256 = Hmac<Sha256>;
type CbcEnc = cbc::Encryptor<aes::Aes256>;
type CbcDec = cbc::Decryptor<aes::Aes256>;

/// Whether a cell encrypts deterministically or with a random IV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionKind {
    /// Same plaintext, same ciphertext; supports equality predicates.
    Deterministic,
    /// Fresh IV per cell; no predicates over the ciphertext.
    Randomized,
}

impl EncryptionKind {
    /// Map from the wire encryption-type byte (1 deterministic, 2 randomized).
    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Deterministic),
            2 => Some(Self::Randomized),
            _ => None,
        }
    }
}

/// A cell cipher bound to one unwrapped column encryption key.
pub struct CellCipher {
    cipher_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
    iv_key: [u8; KEY_SIZE],
}

impl CellCipher {
    /// Derive the cipher from a 32-byte column encryption key.
    pub fn new(cek: &[u8]) -> Result<Self> {
        if cek.len() != KEY_SIZE {
            return Err(KeyError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: cek.len(),
            });
        }
        let key_bits = ((cek.len() * 8) as u16).to_le_bytes();
        Ok(Self {
            cipher_key: derive_subkey(cek, CIPHER_KEY_LABEL, &key_bits)?,
            mac_key: derive_subkey(cek, MAC_KEY_LABEL, &key_bits)?,
            iv_key: derive_subkey(cek, IV_KEY_LABEL, &key_bits)?,
        })
    }

    /// Encrypt one cell.
    pub fn encrypt(&self, plaintext: &[u8], kind: EncryptionKind) -> Result<Vec<u8>> {
        let iv = self.make_iv(kind, plaintext)?;

        let padded_len = (plaintext.len() / BLOCK_SIZE + 1) * BLOCK_SIZE;
        let mut buf = vec![0u8; padded_len];
        buf[..plaintext.len()].copy_from_slice(plaintext);
        let enc = CbcEnc::new_from_slices(&self.cipher_key, &iv)
            .map_err(|e| KeyError::EncryptionFailed(format!("cipher init: {e}")))?;
        let ciphertext = enc
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
            .map_err(|e| KeyError::EncryptionFailed(format!("block encrypt: {e}")))?;

        let mac = self.authenticate(&iv, ciphertext)?;

        let mut cell = Vec::with_capacity(1 + MAC_SIZE + IV_SIZE + ciphertext.len());
        cell.push(FORMAT_VERSION);
        cell.extend_from_slice(&mac);
        cell.extend_from_slice(&iv);
        cell.extend_from_slice(ciphertext);
        Ok(cell)
    }

    /// Decrypt and authenticate one cell.
    pub fn decrypt(&self, cell: &[u8]) -> Result<Vec<u8>> {
        if cell.len() < MIN_CELL_SIZE {
            return Err(KeyError::DecryptionFailed(format!(
                "cell is {} bytes, minimum {MIN_CELL_SIZE}",
                cell.len()
            )));
        }
        if cell[0] != FORMAT_VERSION {
            return Err(KeyError::DecryptionFailed(format!(
                "unknown format version {:#04x}",
                cell[0]
            )));
        }

        let mac = &cell[1..1 + MAC_SIZE];
        let iv = &cell[1 + MAC_SIZE..1 + MAC_SIZE + IV_SIZE];
        let ciphertext = &cell[1 + MAC_SIZE + IV_SIZE..];

        let expected = self.authenticate(iv, ciphertext)?;
        if !fixed_time_eq(mac, &expected) {
            return Err(KeyError::DecryptionFailed(
                "authentication tag mismatch".into(),
            ));
        }

        let dec = CbcDec::new_from_slices(&self.cipher_key, iv)
            .map_err(|e| KeyError::DecryptionFailed(format!("cipher init: {e}")))?;
        let mut buf = ciphertext.to_vec();
        let plaintext = dec
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|e| KeyError::DecryptionFailed(format!("block decrypt: {e}")))?;
        Ok(plaintext.to_vec())
    }

    fn make_iv(&self, kind: EncryptionKind, plaintext: &[u8]) -> Result<[u8; IV_SIZE]> {
        let mut iv = [0u8; IV_SIZE];
        match kind {
            EncryptionKind::Randomized => rand::thread_rng().fill_bytes(&mut iv),
            EncryptionKind::Deterministic => {
                let mut mac = HmacSha256::new_from_slice(&self.iv_key)
                    .map_err(|e| KeyError::EncryptionFailed(format!("mac init: {e}")))?;
                mac.update(plaintext);
                iv.copy_from_slice(&mac.finalize().into_bytes()[..IV_SIZE]);
            }
        }
        Ok(iv)
    }

    /// MAC over `version | iv | ciphertext | version_length`.
    fn authenticate(&self, iv: &[u8], ciphertext: &[u8]) -> Result<[u8; MAC_SIZE]> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|e| KeyError::EncryptionFailed(format!("mac init: {e}")))?;
        mac.update(&[FORMAT_VERSION]);
        mac.update(iv);
        mac.update(ciphertext);
        mac.update(&[1u8]);
        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; MAC_SIZE];
        out.copy_from_slice(&digest);
        Ok(out)
    }
}

impl Drop for CellCipher {
    fn drop(&mut self) {
        self.cipher_key.fill(0);
        self.mac_key.fill(0);
        self.iv_key.fill(0);
    }
}

fn derive_subkey(cek: &[u8], label: &[u8], key_bits: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let mut mac = HmacSha256::new_from_slice(cek)
        .map_err(|e| KeyError::EncryptionFailed(format!("mac init: {e}")))?;
    mac.update(label);
    mac.update(ALGORITHM_LABEL);
    mac.update(key_bits);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&digest);
    Ok(out)
}

fn fixed_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b) {
        acc |= x ^ y;
    }
    acc == 0
}
