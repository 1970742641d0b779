//! AES-256-CBC encryption of backup artifacts.
//!
//! Every encrypted artifact starts with a fresh random 16 byte IV followed by
//! the PKCS#7 padded ciphertext. Encrypted artifacts carry the `.enc` extension.

use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use derive_more::{Display, Error, From};
use rand::rngs::OsRng;
use rand::RngCore;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const BLOCK_SIZE: usize = 16;
const CHUNK_SIZE: usize = 64 * BLOCK_SIZE;

/// Extension of encrypted artifacts.
pub const ENCRYPTED_EXTENSION: &str = "enc";

#[derive(Debug, Display, Error, From)]
pub enum CryptoError {
    /// No durable key material is configured.
    #[display("no encryption key configured; refusing to encrypt or decrypt")]
    MissingKey,
    /// Key material has the wrong shape.
    #[display("invalid encryption key: {_0}")]
    InvalidKey(#[error(ignore)] String),
    /// Ciphertext is truncated or the key is wrong.
    #[display("malformed ciphertext in {}", _0.display())]
    Malformed(#[error(ignore)] PathBuf),
    #[from]
    Io(io::Error),
}

/// A 256 bit AES key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses a key from 64 hexadecimal characters.
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not hexadecimal: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;

        Ok(Self(bytes))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Source of the process-wide encryption key.
pub trait EncryptionKeyProvider: Send + Sync {
    /// Returns the key or fails if none is durably configured.
    fn key(&self) -> Result<EncryptionKey, CryptoError>;
}

/// Key provider backed by configured key material.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyProvider {
    key: Option<EncryptionKey>,
}

impl StaticKeyProvider {
    pub fn new(key: Option<EncryptionKey>) -> Self {
        Self { key }
    }

    /// Provider for an optional hex encoded key.
    pub fn from_hex(hex_key: Option<&str>) -> Result<Self, CryptoError> {
        let key = hex_key.map(EncryptionKey::from_hex).transpose()?;
        Ok(Self { key })
    }
}

impl EncryptionKeyProvider for StaticKeyProvider {
    fn key(&self) -> Result<EncryptionKey, CryptoError> {
        self.key.clone().ok_or(CryptoError::MissingKey)
    }
}

/// Returns if `path` names an encrypted artifact.
pub fn is_encrypted(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == ENCRYPTED_EXTENSION)
}

/// Encrypts `path` into `<path>.enc`. The source is left in place.
pub fn encrypt(path: &Path, key: &EncryptionKey) -> Result<PathBuf, CryptoError> {
    let mut target = OsString::from(path.as_os_str());
    target.push(".");
    target.push(ENCRYPTED_EXTENSION);
    let target = PathBuf::from(target);

    let mut iv = [0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut iv);

    let mut reader = BufReader::new(File::open(path)?);
    let mut writer = BufWriter::new(File::create_new(&target)?);
    writer.write_all(&iv)?;

    let mut cipher = Aes256CbcEnc::new(&key.0.into(), &iv.into());
    let mut pending = Vec::with_capacity(2 * CHUNK_SIZE);
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..read]);

        let full = pending.len() - pending.len() % BLOCK_SIZE;
        for block in pending[..full].chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        writer.write_all(&pending[..full])?;
        pending.drain(..full);
    }

    writer.write_all(&cipher.encrypt_padded_vec_mut::<Pkcs7>(&pending))?;
    writer.flush()?;

    log::debug!(target: "encryption", "Encrypted {}", path.display());
    Ok(target)
}

/// Reverses [encrypt], stripping the `.enc` extension.
pub fn decrypt(path: &Path, key: &EncryptionKey) -> Result<PathBuf, CryptoError> {
    let target = if is_encrypted(path) {
        path.with_extension("")
    } else {
        let mut target = OsString::from(path.as_os_str());
        target.push(".dec");
        PathBuf::from(target)
    };

    let mut reader = BufReader::new(File::open(path)?);
    let mut iv = [0u8; BLOCK_SIZE];
    reader
        .read_exact(&mut iv)
        .map_err(|_| CryptoError::Malformed(path.to_path_buf()))?;

    let mut writer = BufWriter::new(File::create_new(&target)?);
    let mut cipher = Aes256CbcDec::new(&key.0.into(), &iv.into());
    let mut pending = Vec::with_capacity(2 * CHUNK_SIZE);
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..read]);

        // the last block holds the padding and is only decrypted at the end
        if pending.len() <= BLOCK_SIZE {
            continue;
        }
        let full = (pending.len() - 1) / BLOCK_SIZE * BLOCK_SIZE;
        for block in pending[..full].chunks_exact_mut(BLOCK_SIZE) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        writer.write_all(&pending[..full])?;
        pending.drain(..full);
    }

    if pending.len() != BLOCK_SIZE {
        return Err(CryptoError::Malformed(path.to_path_buf()));
    }
    let last = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&pending)
        .map_err(|_| CryptoError::Malformed(path.to_path_buf()))?;
    writer.write_all(&last)?;
    writer.flush()?;

    log::debug!(target: "encryption", "Decrypted {}", path.display());
    Ok(target)
}
