use thiserror::Error;
use zeroize::Zeroize;

use crate::cipher::{BlockCipher, CipherAlgorithm, CipherError, CURRENT_BLOCK_SIZE};
use crate::kdf::mix_field_key;
use crate::session::SessionContext;

pub const RECORD_SALT_LEN: usize = 16;

const FIELD_BLOCK_SIZE: usize = CURRENT_BLOCK_SIZE;

#[derive(Debug, Error)]
pub enum FieldError {
    #[error("randomness source failed")]
    RandomFailure,
    #[error("sealed field is corrupt: {0}")]
    Corrupt(&'static str),
    #[error("field is not valid utf-8")]
    NotText,
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// One field value encrypted at rest in memory. Ciphertext is padded up to a
/// whole number of cipher blocks; the true byte length travels alongside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedField {
    data: Vec<u8>,
    len: u32,
}

impl SealedField {
    /// Encrypt `plain` under the cipher derived from the session secret and
    /// this record's salt. The cipher is built here and dropped on return.
    pub fn seal(
        context: &SessionContext,
        salt: &[u8; RECORD_SALT_LEN],
        plain: &[u8],
    ) -> Result<Self, FieldError> {
        let len = u32::try_from(plain.len()).map_err(|_| FieldError::Corrupt("length"))?;
        let padded_len = plain.len().div_ceil(FIELD_BLOCK_SIZE) * FIELD_BLOCK_SIZE;
        let mut data = vec![0_u8; padded_len];
        data[..plain.len()].copy_from_slice(plain);
        if padded_len > plain.len() {
            getrandom::fill(&mut data[plain.len()..]).map_err(|_| FieldError::RandomFailure)?;
        }
        let cipher = record_cipher(context, salt)?;
        for block in data.chunks_mut(FIELD_BLOCK_SIZE) {
            cipher.encrypt_block(block);
        }
        Ok(Self { data, len })
    }

    pub fn seal_str(
        context: &SessionContext,
        salt: &[u8; RECORD_SALT_LEN],
        plain: &str,
    ) -> Result<Self, FieldError> {
        Self::seal(context, salt, plain.as_bytes())
    }

    /// Decrypt back to the original bytes. The per-record cipher is rebuilt
    /// for this one call.
    pub fn open(
        &self,
        context: &SessionContext,
        salt: &[u8; RECORD_SALT_LEN],
    ) -> Result<Vec<u8>, FieldError> {
        if self.data.len() % FIELD_BLOCK_SIZE != 0 {
            return Err(FieldError::Corrupt("block alignment"));
        }
        if self.len as usize > self.data.len() {
            return Err(FieldError::Corrupt("length"));
        }
        let cipher = record_cipher(context, salt)?;
        let mut data = self.data.clone();
        for block in data.chunks_mut(FIELD_BLOCK_SIZE) {
            cipher.decrypt_block(block);
        }
        data.truncate(self.len as usize);
        Ok(data)
    }

    pub fn open_string(
        &self,
        context: &SessionContext,
        salt: &[u8; RECORD_SALT_LEN],
    ) -> Result<String, FieldError> {
        let mut bytes = self.open(context, salt)?;
        match String::from_utf8(bytes) {
            Ok(text) => Ok(text),
            Err(error) => {
                bytes = error.into_bytes();
                bytes.zeroize();
                Err(FieldError::NotText)
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn record_cipher(
    context: &SessionContext,
    salt: &[u8; RECORD_SALT_LEN],
) -> Result<BlockCipher, FieldError> {
    let mut key = mix_field_key(context.secret(), salt);
    let cipher = BlockCipher::new(CipherAlgorithm::Twofish, &key);
    key.zeroize();
    Ok(cipher?)
}

pub(crate) fn random_record_salt() -> Result<[u8; RECORD_SALT_LEN], FieldError> {
    let mut salt = [0_u8; RECORD_SALT_LEN];
    getrandom::fill(&mut salt).map_err(|_| FieldError::RandomFailure)?;
    Ok(salt)
}
