//! Built-in key providers

use std::fmt;

use crc::{Crc, CRC_16_IBM_3740};

use super::{KeyError, KeyProvider};

// CRC-16/CCITT-FALSE
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

fn require_seed(seed: &[u8]) -> Result<(), KeyError> {
    if seed.is_empty() {
        Err(KeyError::EmptySeed)
    } else {
        Ok(())
    }
}

/// XOR each seed byte with the constant, alternating high and low byte
#[derive(Debug, Clone, Copy)]
pub struct XorKey(pub u16);

impl KeyProvider for XorKey {
    fn calculate(&self, seed: &[u8], _level: u8) -> Result<Vec<u8>, KeyError> {
        require_seed(seed)?;
        let mask = self.0.to_be_bytes();
        Ok(seed
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[i % 2])
            .collect())
    }

    fn name(&self) -> &str {
        "xor"
    }
}

/// Add the constant to each big-endian 16-bit word of the seed
#[derive(Debug, Clone, Copy)]
pub struct AddKey(pub u16);

impl KeyProvider for AddKey {
    fn calculate(&self, seed: &[u8], _level: u8) -> Result<Vec<u8>, KeyError> {
        require_seed(seed)?;
        let mut key = Vec::with_capacity(seed.len());
        for chunk in seed.chunks(2) {
            match chunk {
                [hi, lo] => {
                    let word = u16::from_be_bytes([*hi, *lo]).wrapping_add(self.0);
                    key.extend_from_slice(&word.to_be_bytes());
                }
                [last] => key.push(last.wrapping_add(self.0.to_be_bytes()[0])),
                _ => {}
            }
        }
        Ok(key)
    }

    fn name(&self) -> &str {
        "add"
    }
}

/// Bitwise complement of the seed
#[derive(Debug, Clone, Copy)]
pub struct ComplementKey;

impl KeyProvider for ComplementKey {
    fn calculate(&self, seed: &[u8], _level: u8) -> Result<Vec<u8>, KeyError> {
        require_seed(seed)?;
        Ok(seed.iter().map(|b| !b).collect())
    }

    fn name(&self) -> &str {
        "complement"
    }
}

/// Two-byte key: CRC-16/CCITT-FALSE over the level byte followed by the seed
#[derive(Debug, Clone, Copy)]
pub struct Crc16Key;

impl KeyProvider for Crc16Key {
    fn calculate(&self, seed: &[u8], level: u8) -> Result<Vec<u8>, KeyError> {
        require_seed(seed)?;
        let mut digest = CRC16.digest();
        digest.update(&[level]);
        digest.update(seed);
        Ok(digest.finalize().to_be_bytes().to_vec())
    }

    fn name(&self) -> &str {
        "crc16"
    }
}

type KeyFn = dyn Fn(&[u8], u8) -> Result<Vec<u8>, String> + Send + Sync;

/// Caller-supplied key function, e.g. a wrapper around a vendor library
pub struct ExternalKeyProvider {
    name: String,
    calculate: Box<KeyFn>,
}

impl ExternalKeyProvider {
    pub fn new<F>(name: impl Into<String>, calculate: F) -> Self
    where
        F: Fn(&[u8], u8) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            calculate: Box::new(calculate),
        }
    }
}

impl fmt::Debug for ExternalKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalKeyProvider")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl KeyProvider for ExternalKeyProvider {
    fn calculate(&self, seed: &[u8], level: u8) -> Result<Vec<u8>, KeyError> {
        (self.calculate)(seed, level).map_err(KeyError::Provider)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
