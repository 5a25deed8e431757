use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroize;

use crate::cipher::{BlockCipher, CipherAlgorithm, CipherError};
use crate::kdf::{stretch, verification_tag, KdfError, STRETCHED_KEY_LEN};
use crate::record::{field_type, RawField, RawRecord, UnknownField};

const MAGIC: &[u8; 4] = b"KYRK";
pub const LEGACY_VERSION: u16 = 1;
pub const CURRENT_VERSION: u16 = 2;

const FILE_SALT_LEN: usize = 32;
const KEY_LEN: usize = STRETCHED_KEY_LEN;
const MAC_LEN: usize = 32;
const MAX_FIELD_BYTES: usize = 16 * 1024 * 1024;

const WRAP_INFO_V1: &[u8] = b"keyrack v1 key wrap";
const WRAP_INFO_V2: &[u8] = b"keyrack v2 key wrap";

// Reserved bytes inside a legacy combined title/user field.
const LEGACY_SPLIT_BYTE: u8 = 0xad;
const LEGACY_DEFAULT_USER_BYTE: u8 = 0xa0;

pub(crate) mod header_field {
    pub const VERSION: u8 = 0x00;
    pub const LAST_SAVED_AT: u8 = 0x01;
    pub const LAST_SAVED_BY: u8 = 0x02;
    pub const LAST_SAVED_ON: u8 = 0x03;
    pub const PREFERENCES: u8 = 0x04;
    pub const DISPLAY_STATE: u8 = 0x05;
    pub const END_OF_HEADER: u8 = 0xff;
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("not a credential database")]
    NotThisFormat,
    #[error("unsupported container version {0}")]
    UnsupportedVersion(u16),
    #[error("wrong passphrase")]
    WrongPassword,
    #[error("integrity check failed")]
    IntegrityFailure,
    #[error("unexpected end of data in {0}")]
    Truncated(&'static str),
    #[error("invalid container field: {0}")]
    InvalidField(&'static str),
    #[error("field of {0} bytes exceeds the size limit")]
    FieldTooLarge(usize),
    #[error("key expansion failed")]
    KeyExpansion,
    #[error("randomness source failed")]
    RandomFailure,
    #[error(transparent)]
    Kdf(#[from] KdfError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Database-level metadata stored as the first field section of the
/// container. Unrecognized header fields round-trip untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub format_version: u16,
    pub last_saved_at: u64,
    pub last_saved_by: String,
    pub last_saved_on: String,
    pub preferences: String,
    pub display_state: Vec<u8>,
    pub unknown_fields: Vec<UnknownField>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Substituted when a legacy combined title/user field asks for the
    /// configured default username.
    pub default_username: String,
}

/// Serializes one database to the current container version. Records are
/// appended one at a time; `finish` seals the stream with the MAC trailer.
pub struct ContainerWriter {
    out: Vec<u8>,
    cipher: BlockCipher,
    chain: Vec<u8>,
    mac_key: [u8; KEY_LEN],
}

impl Drop for ContainerWriter {
    fn drop(&mut self) {
        self.mac_key.zeroize();
        self.chain.zeroize();
    }
}

impl ContainerWriter {
    pub fn new(
        passphrase: &str,
        iterations: u32,
        header: &DatabaseHeader,
    ) -> Result<Self, ContainerError> {
        let algorithm = CipherAlgorithm::Twofish;
        let mut salt = [0_u8; FILE_SALT_LEN];
        fill_random(&mut salt)?;
        let stretched = stretch(passphrase, &salt, iterations)?;
        let tag = verification_tag(&stretched);

        let mut wrap_key = expand_key(stretched.as_bytes(), WRAP_INFO_V2)?;
        let wrap_cipher = BlockCipher::new(algorithm, &wrap_key)?;
        wrap_key.zeroize();

        let mut data_key = [0_u8; KEY_LEN];
        fill_random(&mut data_key)?;
        let mut mac_key = [0_u8; KEY_LEN];
        fill_random(&mut mac_key)?;
        let mut wrapped_data_key = data_key;
        wrap_in_place(&wrap_cipher, &mut wrapped_data_key);
        let mut wrapped_mac_key = mac_key;
        wrap_in_place(&wrap_cipher, &mut wrapped_mac_key);

        let mut iv = vec![0_u8; algorithm.block_size()];
        fill_random(&mut iv)?;

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        push_u16_le(&mut out, CURRENT_VERSION);
        out.extend_from_slice(&salt);
        push_u32_le(&mut out, iterations);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&wrapped_data_key);
        out.extend_from_slice(&wrapped_mac_key);
        out.extend_from_slice(&iv);

        let cipher = BlockCipher::new(algorithm, &data_key)?;
        data_key.zeroize();

        let mut writer = Self {
            out,
            cipher,
            chain: iv,
            mac_key,
        };
        writer.write_header_fields(header)?;
        Ok(writer)
    }

    fn write_header_fields(&mut self, header: &DatabaseHeader) -> Result<(), ContainerError> {
        self.write_field(header_field::VERSION, &CURRENT_VERSION.to_le_bytes())?;
        if header.last_saved_at != 0 {
            self.write_field(
                header_field::LAST_SAVED_AT,
                &header.last_saved_at.to_le_bytes(),
            )?;
        }
        if !header.last_saved_by.is_empty() {
            self.write_field(header_field::LAST_SAVED_BY, header.last_saved_by.as_bytes())?;
        }
        if !header.last_saved_on.is_empty() {
            self.write_field(header_field::LAST_SAVED_ON, header.last_saved_on.as_bytes())?;
        }
        if !header.preferences.is_empty() {
            self.write_field(header_field::PREFERENCES, header.preferences.as_bytes())?;
        }
        if !header.display_state.is_empty() {
            self.write_field(header_field::DISPLAY_STATE, &header.display_state)?;
        }
        for unknown in &header.unknown_fields {
            self.write_field(unknown.field_type, &unknown.data)?;
        }
        self.write_field(header_field::END_OF_HEADER, &[])
    }

    /// Append one record's fields followed by the end-of-record marker.
    /// Fields with no data were already omitted by the caller.
    pub fn write_record(&mut self, record: &RawRecord) -> Result<(), ContainerError> {
        for field in record {
            if field.field_type == field_type::END_OF_RECORD {
                continue;
            }
            self.write_field(field.field_type, &field.data)?;
        }
        self.write_field(field_type::END_OF_RECORD, &[])
    }

    /// Seal the stream: append the MAC over every byte written so far.
    pub fn finish(mut self) -> Result<Vec<u8>, ContainerError> {
        let tag = compute_mac(&self.mac_key, &self.out)?;
        self.out.extend_from_slice(&tag);
        Ok(std::mem::take(&mut self.out))
    }

    fn write_field(&mut self, field_type: u8, data: &[u8]) -> Result<(), ContainerError> {
        if data.len() > MAX_FIELD_BYTES {
            return Err(ContainerError::FieldTooLarge(data.len()));
        }
        let block = self.cipher.block_size();
        let head_capacity = block - 5;
        let head_take = data.len().min(head_capacity);

        let mut plain = Vec::with_capacity(block);
        plain.extend_from_slice(&(data.len() as u32).to_le_bytes());
        plain.push(field_type);
        plain.extend_from_slice(&data[..head_take]);
        pad_random(&mut plain, block)?;
        self.emit_block(&mut plain);

        let mut rest = &data[head_take..];
        while !rest.is_empty() {
            let take = rest.len().min(block);
            let mut chunk = rest[..take].to_vec();
            pad_random(&mut chunk, block)?;
            self.emit_block(&mut chunk);
            rest = &rest[take..];
        }
        Ok(())
    }

    fn emit_block(&mut self, plain: &mut Vec<u8>) {
        for (byte, prev) in plain.iter_mut().zip(self.chain.iter()) {
            *byte ^= prev;
        }
        self.cipher.encrypt_block(plain);
        self.chain.copy_from_slice(plain);
        self.out.extend_from_slice(plain);
        plain.zeroize();
    }
}

/// Streams records back out of a container. `open` authenticates the
/// passphrase and reads the header section; `finish` checks the MAC trailer,
/// which is mandatory for current files and absent from legacy ones.
pub struct ContainerReader<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    cipher: BlockCipher,
    chain: Vec<u8>,
    version: u16,
    header: DatabaseHeader,
    mac_key: Option<[u8; KEY_LEN]>,
    default_username: String,
}

impl Drop for ContainerReader<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.mac_key.as_mut() {
            key.zeroize();
        }
        self.chain.zeroize();
    }
}

impl<'a> ContainerReader<'a> {
    pub fn open(
        data: &'a [u8],
        passphrase: &str,
        options: ReadOptions,
    ) -> Result<Self, ContainerError> {
        let mut fixed = SliceReader::new(data);
        let magic = fixed.read_exact(MAGIC.len(), "magic")?;
        if magic != MAGIC {
            return Err(ContainerError::NotThisFormat);
        }
        let version = fixed.read_u16_le("version")?;
        let algorithm = match version {
            LEGACY_VERSION => CipherAlgorithm::Blowfish,
            CURRENT_VERSION => CipherAlgorithm::Twofish,
            other => return Err(ContainerError::UnsupportedVersion(other)),
        };

        let mut salt = [0_u8; FILE_SALT_LEN];
        salt.copy_from_slice(fixed.read_exact(FILE_SALT_LEN, "salt")?);
        let iterations = fixed.read_u32_le("iterations")?;
        let mut expected_tag = [0_u8; 32];
        expected_tag.copy_from_slice(fixed.read_exact(32, "verification hash")?);

        let stretched = stretch(passphrase, &salt, iterations)?;
        let tag = verification_tag(&stretched);
        if !bool::from(tag.ct_eq(&expected_tag)) {
            return Err(ContainerError::WrongPassword);
        }

        let wrap_info = match version {
            LEGACY_VERSION => WRAP_INFO_V1,
            _ => WRAP_INFO_V2,
        };
        let mut wrap_key = expand_key(stretched.as_bytes(), wrap_info)?;
        let wrap_cipher = BlockCipher::new(algorithm, &wrap_key)?;
        wrap_key.zeroize();

        let mut data_key = [0_u8; KEY_LEN];
        data_key.copy_from_slice(fixed.read_exact(KEY_LEN, "wrapped data key")?);
        unwrap_in_place(&wrap_cipher, &mut data_key);

        let mac_key = if version == CURRENT_VERSION {
            let mut key = [0_u8; KEY_LEN];
            key.copy_from_slice(fixed.read_exact(KEY_LEN, "wrapped mac key")?);
            unwrap_in_place(&wrap_cipher, &mut key);
            Some(key)
        } else {
            None
        };

        let block = algorithm.block_size();
        let chain = fixed.read_exact(block, "iv")?.to_vec();
        let body_start = fixed.position();

        let end = if version == CURRENT_VERSION {
            data.len()
                .checked_sub(MAC_LEN)
                .filter(|end| *end >= body_start)
                .ok_or(ContainerError::Truncated("mac trailer"))?
        } else {
            data.len()
        };

        let cipher = BlockCipher::new(algorithm, &data_key)?;
        data_key.zeroize();

        let mut reader = Self {
            data,
            pos: body_start,
            end,
            cipher,
            chain,
            version,
            header: DatabaseHeader::default(),
            mac_key,
            default_username: options.default_username,
        };
        reader.read_header_fields()?;
        Ok(reader)
    }

    #[must_use]
    pub fn version(&self) -> u16 {
        self.version
    }

    #[must_use]
    pub fn header(&self) -> &DatabaseHeader {
        &self.header
    }

    /// The next record, or `None` at a clean end of the field stream.
    /// A stream that ends inside a record reports truncation instead.
    pub fn read_record(&mut self) -> Result<Option<RawRecord>, ContainerError> {
        let mut fields: RawRecord = Vec::new();
        loop {
            let Some(field) = self.read_field()? else {
                if fields.is_empty() {
                    return Ok(None);
                }
                return Err(ContainerError::Truncated("record"));
            };
            match field.field_type {
                field_type::END_OF_RECORD => return Ok(Some(fields)),
                field_type::COMBINED_NAME if self.version == LEGACY_VERSION => {
                    let (title, username) = split_combined_name(
                        &field.data,
                        &self.default_username,
                    );
                    if !title.is_empty() {
                        fields.push(RawField {
                            field_type: field_type::TITLE,
                            data: title,
                        });
                    }
                    if !username.is_empty() {
                        fields.push(RawField {
                            field_type: field_type::USERNAME,
                            data: username,
                        });
                    }
                }
                _ => fields.push(field),
            }
        }
    }

    /// Verify the trailing MAC over every byte that preceded it. Advisory
    /// (a no-op) for legacy containers, which predate the trailer.
    pub fn finish(self) -> Result<(), ContainerError> {
        let Some(mac_key) = self.mac_key.as_ref() else {
            return Ok(());
        };
        let tag = compute_mac(mac_key, &self.data[..self.end])?;
        let stored = &self.data[self.end..];
        if stored.len() != MAC_LEN || !bool::from(tag.ct_eq(stored)) {
            return Err(ContainerError::IntegrityFailure);
        }
        Ok(())
    }

    fn read_header_fields(&mut self) -> Result<(), ContainerError> {
        let mut header = DatabaseHeader::default();
        loop {
            let Some(field) = self.read_field()? else {
                return Err(ContainerError::Truncated("header"));
            };
            match field.field_type {
                header_field::END_OF_HEADER => break,
                header_field::VERSION => {
                    let bytes: [u8; 2] = field
                        .data
                        .as_slice()
                        .try_into()
                        .map_err(|_| ContainerError::InvalidField("header version"))?;
                    header.format_version = u16::from_le_bytes(bytes);
                }
                header_field::LAST_SAVED_AT => {
                    let bytes: [u8; 8] = field
                        .data
                        .as_slice()
                        .try_into()
                        .map_err(|_| ContainerError::InvalidField("last saved timestamp"))?;
                    header.last_saved_at = u64::from_le_bytes(bytes);
                }
                header_field::LAST_SAVED_BY => {
                    header.last_saved_by = String::from_utf8_lossy(&field.data).into_owned();
                }
                header_field::LAST_SAVED_ON => {
                    header.last_saved_on = String::from_utf8_lossy(&field.data).into_owned();
                }
                header_field::PREFERENCES => {
                    header.preferences = String::from_utf8_lossy(&field.data).into_owned();
                }
                header_field::DISPLAY_STATE => header.display_state = field.data,
                other => header.unknown_fields.push(UnknownField {
                    field_type: other,
                    data: field.data,
                }),
            }
        }
        self.header = header;
        Ok(())
    }

    fn read_field(&mut self) -> Result<Option<RawField>, ContainerError> {
        if self.pos >= self.end {
            return Ok(None);
        }
        let block = self.cipher.block_size();
        let mut first = self.read_block()?;
        let len = u32::from_le_bytes([first[0], first[1], first[2], first[3]]) as usize;
        let field_type = first[4];
        if len > MAX_FIELD_BYTES {
            first.zeroize();
            return Err(ContainerError::FieldTooLarge(len));
        }

        let head_capacity = block - 5;
        let mut data = Vec::with_capacity(len);
        data.extend_from_slice(&first[5..5 + len.min(head_capacity)]);
        first.zeroize();

        let mut remaining = len.saturating_sub(head_capacity);
        while remaining > 0 {
            let mut chunk = self.read_block()?;
            let take = remaining.min(block);
            data.extend_from_slice(&chunk[..take]);
            chunk.zeroize();
            remaining -= take;
        }
        Ok(Some(RawField { field_type, data }))
    }

    fn read_block(&mut self) -> Result<Vec<u8>, ContainerError> {
        let block = self.cipher.block_size();
        if self.end - self.pos < block {
            return Err(ContainerError::Truncated("cipher block"));
        }
        let ciphertext = &self.data[self.pos..self.pos + block];
        let mut plain = ciphertext.to_vec();
        self.cipher.decrypt_block(&mut plain);
        for (byte, prev) in plain.iter_mut().zip(self.chain.iter()) {
            *byte ^= prev;
        }
        self.chain.copy_from_slice(ciphertext);
        self.pos += block;
        Ok(plain)
    }
}

/// Legacy files stored title and user in a single field: either split by a
/// reserved byte, or flagged with a second reserved byte meaning "use the
/// configured default username". Normalized here; never written back.
fn split_combined_name(data: &[u8], default_username: &str) -> (Vec<u8>, Vec<u8>) {
    if let Some(index) = data.iter().position(|&byte| byte == LEGACY_SPLIT_BYTE) {
        return (data[..index].to_vec(), data[index + 1..].to_vec());
    }
    if let Some(index) = data.iter().position(|&byte| byte == LEGACY_DEFAULT_USER_BYTE) {
        return (data[..index].to_vec(), default_username.as_bytes().to_vec());
    }
    (data.to_vec(), Vec::new())
}

fn expand_key(
    stretched: &[u8; STRETCHED_KEY_LEN],
    info: &[u8],
) -> Result<[u8; KEY_LEN], ContainerError> {
    let hkdf = Hkdf::<Sha256>::new(None, stretched);
    let mut output = [0_u8; KEY_LEN];
    hkdf.expand(info, &mut output)
        .map_err(|_| ContainerError::KeyExpansion)?;
    Ok(output)
}

fn wrap_in_place(cipher: &BlockCipher, key: &mut [u8; KEY_LEN]) {
    for chunk in key.chunks_mut(cipher.block_size()) {
        cipher.encrypt_block(chunk);
    }
}

fn unwrap_in_place(cipher: &BlockCipher, key: &mut [u8; KEY_LEN]) {
    for chunk in key.chunks_mut(cipher.block_size()) {
        cipher.decrypt_block(chunk);
    }
}

fn compute_mac(key: &[u8; KEY_LEN], bytes: &[u8]) -> Result<[u8; MAC_LEN], ContainerError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| ContainerError::InvalidField("mac key"))?;
    mac.update(bytes);
    Ok(mac.finalize().into_bytes().into())
}

fn pad_random(buffer: &mut Vec<u8>, block: usize) -> Result<(), ContainerError> {
    let used = buffer.len();
    if used < block {
        buffer.resize(block, 0);
        fill_random(&mut buffer[used..])?;
    }
    Ok(())
}

fn fill_random(buffer: &mut [u8]) -> Result<(), ContainerError> {
    getrandom::fill(buffer).map_err(|_| ContainerError::RandomFailure)
}

struct SliceReader<'a> {
    input: &'a [u8],
    position: usize,
}

impl<'a> SliceReader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, position: 0 }
    }

    fn position(&self) -> usize {
        self.position
    }

    fn read_exact(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ContainerError> {
        let end = self
            .position
            .checked_add(len)
            .ok_or(ContainerError::Truncated(what))?;
        if end > self.input.len() {
            return Err(ContainerError::Truncated(what));
        }
        let bytes = &self.input[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    fn read_u16_le(&mut self, what: &'static str) -> Result<u16, ContainerError> {
        let mut bytes = [0_u8; 2];
        bytes.copy_from_slice(self.read_exact(2, what)?);
        Ok(u16::from_le_bytes(bytes))
    }

    fn read_u32_le(&mut self, what: &'static str) -> Result<u32, ContainerError> {
        let mut bytes = [0_u8; 4];
        bytes.copy_from_slice(self.read_exact(4, what)?);
        Ok(u32::from_le_bytes(bytes))
    }
}

fn push_u16_le(output: &mut Vec<u8>, value: u16) {
    output.extend_from_slice(&value.to_le_bytes());
}

fn push_u32_le(output: &mut Vec<u8>, value: u32) {
    output.extend_from_slice(&value.to_le_bytes());
}
