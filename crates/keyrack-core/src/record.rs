use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::field::{random_record_salt, FieldError, SealedField, RECORD_SALT_LEN};
use crate::policy::{PasswordPolicy, PolicyError};
use crate::session::SessionContext;

/// Wire type codes for record fields inside the container stream.
pub mod field_type {
    pub const COMBINED_NAME: u8 = 0x00; // legacy containers only
    pub const UUID: u8 = 0x01;
    pub const GROUP: u8 = 0x02;
    pub const TITLE: u8 = 0x03;
    pub const USERNAME: u8 = 0x04;
    pub const NOTES: u8 = 0x05;
    pub const PASSWORD: u8 = 0x06;
    pub const CREATED_AT: u8 = 0x07;
    pub const PASSWORD_CHANGED_AT: u8 = 0x08;
    pub const ACCESSED_AT: u8 = 0x09;
    pub const EXPIRES_AT: u8 = 0x0a;
    pub const MODIFIED_AT: u8 = 0x0b;
    pub const URL: u8 = 0x0c;
    pub const AUTOTYPE: u8 = 0x0d;
    pub const PASSWORD_HISTORY: u8 = 0x0e;
    pub const POLICY: u8 = 0x0f;
    pub const EXPIRY_INTERVAL: u8 = 0x10;
    pub const RUN_COMMAND: u8 = 0x11;
    pub const DCLICK_ACTION: u8 = 0x12;
    pub const EMAIL: u8 = 0x13;
    pub const PROTECTED: u8 = 0x14;
    pub const OWN_SYMBOLS: u8 = 0x15;
    pub const SHIFT_DCLICK_ACTION: u8 = 0x16;
    pub const POLICY_NAME: u8 = 0x17;
    pub const END_OF_RECORD: u8 = 0xff;
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error("invalid inline policy: {0}")]
    Policy(#[from] PolicyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Normal,
    AliasBase,
    Alias,
    ShortcutBase,
    Shortcut,
}

impl RecordKind {
    #[must_use]
    pub fn is_base(self) -> bool {
        matches!(self, Self::AliasBase | Self::ShortcutBase)
    }

    #[must_use]
    pub fn is_dependent(self) -> bool {
        matches!(self, Self::Alias | Self::Shortcut)
    }
}

/// Change-tracking tag; transient, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Clean,
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    Alias,
    Shortcut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyRef {
    pub base: Uuid,
    pub kind: DependencyKind,
}

/// A field type this version does not understand, carried through untouched
/// so newer files survive a load/save cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownField {
    pub field_type: u8,
    pub data: Vec<u8>,
}

/// One raw (type, bytes) pair as it appears inside the container's field
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawField {
    pub field_type: u8,
    pub data: Vec<u8>,
}

pub type RawRecord = Vec<RawField>;

/// One credential entry. Every value-bearing attribute is sealed under the
/// record's own field cipher; opening or changing one goes through the
/// injected session context.
#[derive(Debug, Clone)]
pub struct Record {
    uuid: Uuid,
    salt: [u8; RECORD_SALT_LEN],
    kind: RecordKind,
    status: RecordStatus,
    group: Option<SealedField>,
    title: Option<SealedField>,
    username: Option<SealedField>,
    password: Option<SealedField>,
    notes: Option<SealedField>,
    url: Option<SealedField>,
    email: Option<SealedField>,
    autotype: Option<SealedField>,
    run_command: Option<SealedField>,
    own_symbols: Option<SealedField>,
    policy_name: Option<SealedField>,
    policy: Option<SealedField>,
    history: Option<SealedField>,
    created_at: Option<SealedField>,
    password_changed_at: Option<SealedField>,
    accessed_at: Option<SealedField>,
    expires_at: Option<SealedField>,
    modified_at: Option<SealedField>,
    expiry_interval: Option<SealedField>,
    dclick_action: Option<SealedField>,
    shift_dclick_action: Option<SealedField>,
    protected: Option<SealedField>,
    unknown_fields: Vec<UnknownField>,
}

impl Record {
    pub fn new() -> Result<Self, RecordError> {
        Ok(Self::with_identity(Uuid::new_v4(), random_record_salt()?))
    }

    pub(crate) fn with_identity(uuid: Uuid, salt: [u8; RECORD_SALT_LEN]) -> Self {
        Self {
            uuid,
            salt,
            kind: RecordKind::Normal,
            status: RecordStatus::Added,
            group: None,
            title: None,
            username: None,
            password: None,
            notes: None,
            url: None,
            email: None,
            autotype: None,
            run_command: None,
            own_symbols: None,
            policy_name: None,
            policy: None,
            history: None,
            created_at: None,
            password_changed_at: None,
            accessed_at: None,
            expires_at: None,
            modified_at: None,
            expiry_interval: None,
            dclick_action: None,
            shift_dclick_action: None,
            protected: None,
            unknown_fields: Vec::new(),
        }
    }

    /// A copy under a fresh identity. The field-cipher salt is carried over
    /// so the copied sealed values stay readable; dependents are not.
    pub fn duplicate(&self) -> Self {
        let mut copy = self.clone();
        copy.uuid = Uuid::new_v4();
        copy.kind = RecordKind::Normal;
        copy.status = RecordStatus::Added;
        copy
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub(crate) fn set_uuid(&mut self, uuid: Uuid) {
        self.uuid = uuid;
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub(crate) fn set_kind(&mut self, kind: RecordKind) {
        self.kind = kind;
    }

    #[must_use]
    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RecordStatus) {
        self.status = status;
    }

    #[must_use]
    pub fn unknown_fields(&self) -> &[UnknownField] {
        &self.unknown_fields
    }

    pub fn group(&self, context: &SessionContext) -> Result<String, RecordError> {
        self.open_text(context, &self.group)
    }

    pub fn set_group(&mut self, context: &SessionContext, value: &str) -> Result<(), RecordError> {
        self.group = seal_text(context, &self.salt, value)?;
        Ok(())
    }

    pub fn title(&self, context: &SessionContext) -> Result<String, RecordError> {
        self.open_text(context, &self.title)
    }

    pub fn set_title(&mut self, context: &SessionContext, value: &str) -> Result<(), RecordError> {
        self.title = seal_text(context, &self.salt, value)?;
        Ok(())
    }

    pub fn username(&self, context: &SessionContext) -> Result<String, RecordError> {
        self.open_text(context, &self.username)
    }

    pub fn set_username(
        &mut self,
        context: &SessionContext,
        value: &str,
    ) -> Result<(), RecordError> {
        self.username = seal_text(context, &self.salt, value)?;
        Ok(())
    }

    pub fn password(&self, context: &SessionContext) -> Result<String, RecordError> {
        self.open_text(context, &self.password)
    }

    pub fn set_password(
        &mut self,
        context: &SessionContext,
        value: &str,
    ) -> Result<(), RecordError> {
        self.password = seal_text(context, &self.salt, value)?;
        Ok(())
    }

    #[must_use]
    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn notes(&self, context: &SessionContext) -> Result<String, RecordError> {
        self.open_text(context, &self.notes)
    }

    pub fn set_notes(&mut self, context: &SessionContext, value: &str) -> Result<(), RecordError> {
        self.notes = seal_text(context, &self.salt, value)?;
        Ok(())
    }

    pub fn url(&self, context: &SessionContext) -> Result<String, RecordError> {
        self.open_text(context, &self.url)
    }

    pub fn set_url(&mut self, context: &SessionContext, value: &str) -> Result<(), RecordError> {
        self.url = seal_text(context, &self.salt, value)?;
        Ok(())
    }

    pub fn email(&self, context: &SessionContext) -> Result<String, RecordError> {
        self.open_text(context, &self.email)
    }

    pub fn set_email(&mut self, context: &SessionContext, value: &str) -> Result<(), RecordError> {
        self.email = seal_text(context, &self.salt, value)?;
        Ok(())
    }

    pub fn autotype(&self, context: &SessionContext) -> Result<String, RecordError> {
        self.open_text(context, &self.autotype)
    }

    pub fn set_autotype(
        &mut self,
        context: &SessionContext,
        value: &str,
    ) -> Result<(), RecordError> {
        self.autotype = seal_text(context, &self.salt, value)?;
        Ok(())
    }

    pub fn run_command(&self, context: &SessionContext) -> Result<String, RecordError> {
        self.open_text(context, &self.run_command)
    }

    pub fn set_run_command(
        &mut self,
        context: &SessionContext,
        value: &str,
    ) -> Result<(), RecordError> {
        self.run_command = seal_text(context, &self.salt, value)?;
        Ok(())
    }

    pub fn own_symbols(&self, context: &SessionContext) -> Result<String, RecordError> {
        self.open_text(context, &self.own_symbols)
    }

    pub fn set_own_symbols(
        &mut self,
        context: &SessionContext,
        value: &str,
    ) -> Result<(), RecordError> {
        self.own_symbols = seal_text(context, &self.salt, value)?;
        Ok(())
    }

    pub fn policy_name(&self, context: &SessionContext) -> Result<String, RecordError> {
        self.open_text(context, &self.policy_name)
    }

    pub fn set_policy_name(
        &mut self,
        context: &SessionContext,
        value: &str,
    ) -> Result<(), RecordError> {
        self.policy_name = seal_text(context, &self.salt, value)?;
        Ok(())
    }

    pub fn history(&self, context: &SessionContext) -> Result<String, RecordError> {
        self.open_text(context, &self.history)
    }

    pub fn set_history(
        &mut self,
        context: &SessionContext,
        value: &str,
    ) -> Result<(), RecordError> {
        self.history = seal_text(context, &self.salt, value)?;
        Ok(())
    }

    pub fn policy(&self, context: &SessionContext) -> Result<Option<PasswordPolicy>, RecordError> {
        match &self.policy {
            None => Ok(None),
            Some(sealed) => {
                let encoded = sealed.open_string(context, &self.salt)?;
                Ok(Some(PasswordPolicy::decode(&encoded)?))
            }
        }
    }

    pub fn set_policy(
        &mut self,
        context: &SessionContext,
        value: Option<&PasswordPolicy>,
    ) -> Result<(), RecordError> {
        self.policy = match value {
            None => None,
            Some(policy) => {
                policy.validate()?;
                Some(SealedField::seal_str(context, &self.salt, &policy.encode())?)
            }
        };
        Ok(())
    }

    pub fn created_at(&self, context: &SessionContext) -> Result<Option<u64>, RecordError> {
        self.open_u64(context, &self.created_at)
    }

    pub fn set_created_at(
        &mut self,
        context: &SessionContext,
        value: Option<u64>,
    ) -> Result<(), RecordError> {
        self.created_at = seal_u64(context, &self.salt, value)?;
        Ok(())
    }

    pub fn password_changed_at(
        &self,
        context: &SessionContext,
    ) -> Result<Option<u64>, RecordError> {
        self.open_u64(context, &self.password_changed_at)
    }

    pub fn set_password_changed_at(
        &mut self,
        context: &SessionContext,
        value: Option<u64>,
    ) -> Result<(), RecordError> {
        self.password_changed_at = seal_u64(context, &self.salt, value)?;
        Ok(())
    }

    pub fn accessed_at(&self, context: &SessionContext) -> Result<Option<u64>, RecordError> {
        self.open_u64(context, &self.accessed_at)
    }

    pub fn set_accessed_at(
        &mut self,
        context: &SessionContext,
        value: Option<u64>,
    ) -> Result<(), RecordError> {
        self.accessed_at = seal_u64(context, &self.salt, value)?;
        Ok(())
    }

    pub fn expires_at(&self, context: &SessionContext) -> Result<Option<u64>, RecordError> {
        self.open_u64(context, &self.expires_at)
    }

    pub fn set_expires_at(
        &mut self,
        context: &SessionContext,
        value: Option<u64>,
    ) -> Result<(), RecordError> {
        self.expires_at = seal_u64(context, &self.salt, value)?;
        Ok(())
    }

    pub fn modified_at(&self, context: &SessionContext) -> Result<Option<u64>, RecordError> {
        self.open_u64(context, &self.modified_at)
    }

    pub fn set_modified_at(
        &mut self,
        context: &SessionContext,
        value: Option<u64>,
    ) -> Result<(), RecordError> {
        self.modified_at = seal_u64(context, &self.salt, value)?;
        Ok(())
    }

    pub fn expiry_interval(&self, context: &SessionContext) -> Result<Option<u16>, RecordError> {
        self.open_u16(context, &self.expiry_interval)
    }

    pub fn set_expiry_interval(
        &mut self,
        context: &SessionContext,
        value: Option<u16>,
    ) -> Result<(), RecordError> {
        self.expiry_interval = seal_u16(context, &self.salt, value)?;
        Ok(())
    }

    pub fn dclick_action(&self, context: &SessionContext) -> Result<Option<u16>, RecordError> {
        self.open_u16(context, &self.dclick_action)
    }

    pub fn set_dclick_action(
        &mut self,
        context: &SessionContext,
        value: Option<u16>,
    ) -> Result<(), RecordError> {
        self.dclick_action = seal_u16(context, &self.salt, value)?;
        Ok(())
    }

    pub fn shift_dclick_action(
        &self,
        context: &SessionContext,
    ) -> Result<Option<u16>, RecordError> {
        self.open_u16(context, &self.shift_dclick_action)
    }

    pub fn set_shift_dclick_action(
        &mut self,
        context: &SessionContext,
        value: Option<u16>,
    ) -> Result<(), RecordError> {
        self.shift_dclick_action = seal_u16(context, &self.salt, value)?;
        Ok(())
    }

    pub fn protected(&self, context: &SessionContext) -> Result<bool, RecordError> {
        match &self.protected {
            None => Ok(false),
            Some(sealed) => Ok(sealed.open(context, &self.salt)?.first().copied() == Some(1)),
        }
    }

    pub fn set_protected(
        &mut self,
        context: &SessionContext,
        value: bool,
    ) -> Result<(), RecordError> {
        self.protected = if value {
            Some(SealedField::seal(context, &self.salt, &[1])?)
        } else {
            None
        };
        Ok(())
    }

    /// Serialize to the container's raw field list. Absent fields are not
    /// emitted at all. For alias and shortcut records the password slot
    /// carries the base reference instead of a secret.
    pub fn to_raw(
        &self,
        context: &SessionContext,
        dependency: Option<&DependencyRef>,
    ) -> Result<RawRecord, RecordError> {
        let mut raw = Vec::new();
        raw.push(RawField {
            field_type: field_type::UUID,
            data: self.uuid.as_bytes().to_vec(),
        });
        self.push_text(context, &mut raw, field_type::GROUP, &self.group)?;
        self.push_text(context, &mut raw, field_type::TITLE, &self.title)?;
        self.push_text(context, &mut raw, field_type::USERNAME, &self.username)?;
        match dependency {
            Some(dependency) => raw.push(RawField {
                field_type: field_type::PASSWORD,
                data: format_reference(dependency).into_bytes(),
            }),
            None => self.push_text(context, &mut raw, field_type::PASSWORD, &self.password)?,
        }
        self.push_text(context, &mut raw, field_type::NOTES, &self.notes)?;
        self.push_text(context, &mut raw, field_type::URL, &self.url)?;
        self.push_text(context, &mut raw, field_type::EMAIL, &self.email)?;
        self.push_text(context, &mut raw, field_type::AUTOTYPE, &self.autotype)?;
        self.push_text(context, &mut raw, field_type::RUN_COMMAND, &self.run_command)?;
        self.push_text(context, &mut raw, field_type::OWN_SYMBOLS, &self.own_symbols)?;
        self.push_text(context, &mut raw, field_type::POLICY_NAME, &self.policy_name)?;
        self.push_text(context, &mut raw, field_type::POLICY, &self.policy)?;
        self.push_text(context, &mut raw, field_type::PASSWORD_HISTORY, &self.history)?;
        self.push_u64(context, &mut raw, field_type::CREATED_AT, &self.created_at)?;
        self.push_u64(
            context,
            &mut raw,
            field_type::PASSWORD_CHANGED_AT,
            &self.password_changed_at,
        )?;
        self.push_u64(context, &mut raw, field_type::ACCESSED_AT, &self.accessed_at)?;
        self.push_u64(context, &mut raw, field_type::EXPIRES_AT, &self.expires_at)?;
        self.push_u64(context, &mut raw, field_type::MODIFIED_AT, &self.modified_at)?;
        self.push_u16(
            context,
            &mut raw,
            field_type::EXPIRY_INTERVAL,
            &self.expiry_interval,
        )?;
        self.push_u16(context, &mut raw, field_type::DCLICK_ACTION, &self.dclick_action)?;
        self.push_u16(
            context,
            &mut raw,
            field_type::SHIFT_DCLICK_ACTION,
            &self.shift_dclick_action,
        )?;
        if self.protected(context)? {
            raw.push(RawField {
                field_type: field_type::PROTECTED,
                data: vec![1],
            });
        }
        for unknown in &self.unknown_fields {
            raw.push(RawField {
                field_type: unknown.field_type,
                data: unknown.data.clone(),
            });
        }
        Ok(raw)
    }

    /// Rebuild a record from raw container fields. Field data that does not
    /// fit its declared type is preserved as an unknown field rather than
    /// dropped; a missing UUID comes back nil for the store to repair.
    pub fn from_raw(
        context: &SessionContext,
        raw: RawRecord,
    ) -> Result<(Self, Option<DependencyRef>), RecordError> {
        let salt = random_record_salt()?;
        let mut record = Self::with_identity(Uuid::nil(), salt);
        record.status = RecordStatus::Clean;
        let mut dependency = None;

        for field in raw {
            let RawField {
                field_type: kind,
                mut data,
            } = field;
            match kind {
                field_type::UUID => match <[u8; 16]>::try_from(data.as_slice()) {
                    Ok(bytes) => record.uuid = Uuid::from_bytes(bytes),
                    Err(_) => {
                        record.keep_unknown(kind, data);
                        continue;
                    }
                },
                field_type::GROUP => record.group = seal_bytes(context, &salt, &data)?,
                field_type::TITLE => record.title = seal_bytes(context, &salt, &data)?,
                field_type::USERNAME => record.username = seal_bytes(context, &salt, &data)?,
                field_type::PASSWORD => {
                    let text = String::from_utf8_lossy(&data);
                    if let Some(reference) = parse_reference(&text) {
                        dependency = Some(reference);
                        record.kind = match reference.kind {
                            DependencyKind::Alias => RecordKind::Alias,
                            DependencyKind::Shortcut => RecordKind::Shortcut,
                        };
                    } else {
                        record.password = seal_bytes(context, &salt, &data)?;
                    }
                }
                field_type::NOTES => record.notes = seal_bytes(context, &salt, &data)?,
                field_type::URL => record.url = seal_bytes(context, &salt, &data)?,
                field_type::EMAIL => record.email = seal_bytes(context, &salt, &data)?,
                field_type::AUTOTYPE => record.autotype = seal_bytes(context, &salt, &data)?,
                field_type::RUN_COMMAND => {
                    record.run_command = seal_bytes(context, &salt, &data)?;
                }
                field_type::OWN_SYMBOLS => {
                    record.own_symbols = seal_bytes(context, &salt, &data)?;
                }
                field_type::POLICY_NAME => {
                    record.policy_name = seal_bytes(context, &salt, &data)?;
                }
                field_type::POLICY => record.policy = seal_bytes(context, &salt, &data)?,
                field_type::PASSWORD_HISTORY => {
                    record.history = seal_bytes(context, &salt, &data)?;
                }
                field_type::CREATED_AT
                | field_type::PASSWORD_CHANGED_AT
                | field_type::ACCESSED_AT
                | field_type::EXPIRES_AT
                | field_type::MODIFIED_AT => {
                    if data.len() != 8 {
                        record.keep_unknown(kind, data);
                        continue;
                    }
                    let sealed = Some(SealedField::seal(context, &salt, &data)?);
                    match kind {
                        field_type::CREATED_AT => record.created_at = sealed,
                        field_type::PASSWORD_CHANGED_AT => record.password_changed_at = sealed,
                        field_type::ACCESSED_AT => record.accessed_at = sealed,
                        field_type::EXPIRES_AT => record.expires_at = sealed,
                        _ => record.modified_at = sealed,
                    }
                }
                field_type::EXPIRY_INTERVAL
                | field_type::DCLICK_ACTION
                | field_type::SHIFT_DCLICK_ACTION => {
                    if data.len() != 2 {
                        record.keep_unknown(kind, data);
                        continue;
                    }
                    let sealed = Some(SealedField::seal(context, &salt, &data)?);
                    match kind {
                        field_type::EXPIRY_INTERVAL => record.expiry_interval = sealed,
                        field_type::DCLICK_ACTION => record.dclick_action = sealed,
                        _ => record.shift_dclick_action = sealed,
                    }
                }
                field_type::PROTECTED => {
                    if data.first().copied() == Some(1) {
                        record.protected = Some(SealedField::seal(context, &salt, &[1])?);
                    }
                }
                _ => {
                    record.keep_unknown(kind, data);
                    continue;
                }
            }
            data.zeroize();
        }

        Ok((record, dependency))
    }

    fn keep_unknown(&mut self, field_type: u8, data: Vec<u8>) {
        self.unknown_fields.push(UnknownField { field_type, data });
    }

    fn open_text(
        &self,
        context: &SessionContext,
        field: &Option<SealedField>,
    ) -> Result<String, RecordError> {
        match field {
            None => Ok(String::new()),
            Some(sealed) => Ok(sealed.open_string(context, &self.salt)?),
        }
    }

    fn open_u64(
        &self,
        context: &SessionContext,
        field: &Option<SealedField>,
    ) -> Result<Option<u64>, RecordError> {
        match field {
            None => Ok(None),
            Some(sealed) => {
                let bytes = sealed.open(context, &self.salt)?;
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| FieldError::Corrupt("timestamp width"))?;
                Ok(Some(u64::from_le_bytes(bytes)))
            }
        }
    }

    fn open_u16(
        &self,
        context: &SessionContext,
        field: &Option<SealedField>,
    ) -> Result<Option<u16>, RecordError> {
        match field {
            None => Ok(None),
            Some(sealed) => {
                let bytes = sealed.open(context, &self.salt)?;
                let bytes: [u8; 2] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| FieldError::Corrupt("integer width"))?;
                Ok(Some(u16::from_le_bytes(bytes)))
            }
        }
    }

    fn push_text(
        &self,
        context: &SessionContext,
        raw: &mut RawRecord,
        field_type: u8,
        field: &Option<SealedField>,
    ) -> Result<(), RecordError> {
        if let Some(sealed) = field {
            let mut data = sealed.open(context, &self.salt)?;
            raw.push(RawField {
                field_type,
                data: std::mem::take(&mut data),
            });
        }
        Ok(())
    }

    fn push_u64(
        &self,
        context: &SessionContext,
        raw: &mut RawRecord,
        field_type: u8,
        field: &Option<SealedField>,
    ) -> Result<(), RecordError> {
        self.push_text(context, raw, field_type, field)
    }

    fn push_u16(
        &self,
        context: &SessionContext,
        raw: &mut RawRecord,
        field_type: u8,
        field: &Option<SealedField>,
    ) -> Result<(), RecordError> {
        self.push_text(context, raw, field_type, field)
    }
}

fn seal_text(
    context: &SessionContext,
    salt: &[u8; RECORD_SALT_LEN],
    value: &str,
) -> Result<Option<SealedField>, RecordError> {
    if value.is_empty() {
        Ok(None)
    } else {
        Ok(Some(SealedField::seal_str(context, salt, value)?))
    }
}

fn seal_bytes(
    context: &SessionContext,
    salt: &[u8; RECORD_SALT_LEN],
    value: &[u8],
) -> Result<Option<SealedField>, RecordError> {
    if value.is_empty() {
        Ok(None)
    } else {
        Ok(Some(SealedField::seal(context, salt, value)?))
    }
}

fn seal_u64(
    context: &SessionContext,
    salt: &[u8; RECORD_SALT_LEN],
    value: Option<u64>,
) -> Result<Option<SealedField>, RecordError> {
    match value {
        None => Ok(None),
        Some(value) => Ok(Some(SealedField::seal(context, salt, &value.to_le_bytes())?)),
    }
}

fn seal_u16(
    context: &SessionContext,
    salt: &[u8; RECORD_SALT_LEN],
    value: Option<u16>,
) -> Result<Option<SealedField>, RecordError> {
    match value {
        None => Ok(None),
        Some(value) => Ok(Some(SealedField::seal(context, salt, &value.to_le_bytes())?)),
    }
}

#[must_use]
pub fn format_reference(dependency: &DependencyRef) -> String {
    let hex = dependency.base.simple();
    match dependency.kind {
        DependencyKind::Alias => format!("[[{hex}]]"),
        DependencyKind::Shortcut => format!("[~{hex}~]"),
    }
}

#[must_use]
pub fn parse_reference(text: &str) -> Option<DependencyRef> {
    let (kind, hex) = if let Some(rest) = text.strip_prefix("[[").and_then(|r| r.strip_suffix("]]"))
    {
        (DependencyKind::Alias, rest)
    } else if let Some(rest) = text.strip_prefix("[~").and_then(|r| r.strip_suffix("~]")) {
        (DependencyKind::Shortcut, rest)
    } else {
        return None;
    };
    if hex.len() != 32 {
        return None;
    }
    let base = Uuid::try_parse(hex).ok()?;
    Some(DependencyRef { base, kind })
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{
        format_reference, parse_reference, DependencyKind, DependencyRef, Record, RecordKind,
        RecordStatus,
    };
    use crate::policy::PasswordPolicy;
    use crate::session::SessionContext;

    fn context() -> SessionContext {
        SessionContext::unregistered().expect("context")
    }

    #[test]
    fn text_fields_roundtrip_and_empty_means_absent() {
        let context = context();
        let mut record = Record::new().expect("record");
        record.set_title(&context, "Mail").expect("set");
        record.set_password(&context, "s3cr3t\x00!").expect("set");
        assert_eq!(record.title(&context).expect("get"), "Mail");
        assert_eq!(record.password(&context).expect("get"), "s3cr3t\x00!");
        assert_eq!(record.notes(&context).expect("get"), "");

        record.set_title(&context, "").expect("set");
        assert_eq!(record.title(&context).expect("get"), "");
    }

    #[test]
    fn numeric_fields_roundtrip() {
        let context = context();
        let mut record = Record::new().expect("record");
        record.set_created_at(&context, Some(1_700_000_000)).expect("set");
        record.set_expiry_interval(&context, Some(90)).expect("set");
        record.set_protected(&context, true).expect("set");
        assert_eq!(record.created_at(&context).expect("get"), Some(1_700_000_000));
        assert_eq!(record.expiry_interval(&context).expect("get"), Some(90));
        assert!(record.protected(&context).expect("get"));
        assert_eq!(record.accessed_at(&context).expect("get"), None);
    }

    #[test]
    fn inline_policy_roundtrips() {
        let context = context();
        let mut record = Record::new().expect("record");
        assert_eq!(record.policy(&context).expect("get"), None);
        let policy = PasswordPolicy::default();
        record.set_policy(&context, Some(&policy)).expect("set");
        assert_eq!(record.policy(&context).expect("get"), Some(policy));
    }

    #[test]
    fn raw_roundtrip_preserves_all_fields() {
        let context = context();
        let mut record = Record::new().expect("record");
        record.set_group(&context, "Work.Infra").expect("set");
        record.set_title(&context, "Router").expect("set");
        record.set_username(&context, "admin").expect("set");
        record.set_password(&context, "päss\u{2603}").expect("set");
        record.set_notes(&context, "line one\nline two").expect("set");
        record.set_url(&context, "https://192.168.0.1").expect("set");
        record.set_modified_at(&context, Some(42)).expect("set");
        record.set_dclick_action(&context, Some(3)).expect("set");

        let raw = record.to_raw(&context, None).expect("to_raw");
        let (rebuilt, dependency) = Record::from_raw(&context, raw).expect("from_raw");
        assert!(dependency.is_none());
        assert_eq!(rebuilt.uuid(), record.uuid());
        assert_eq!(rebuilt.status(), RecordStatus::Clean);
        assert_eq!(rebuilt.group(&context).expect("get"), "Work.Infra");
        assert_eq!(rebuilt.title(&context).expect("get"), "Router");
        assert_eq!(rebuilt.username(&context).expect("get"), "admin");
        assert_eq!(rebuilt.password(&context).expect("get"), "päss\u{2603}");
        assert_eq!(rebuilt.notes(&context).expect("get"), "line one\nline two");
        assert_eq!(rebuilt.url(&context).expect("get"), "https://192.168.0.1");
        assert_eq!(rebuilt.modified_at(&context).expect("get"), Some(42));
        assert_eq!(rebuilt.dclick_action(&context).expect("get"), Some(3));
    }

    #[test]
    fn unknown_raw_fields_survive_a_roundtrip() {
        let context = context();
        let record = Record::new().expect("record");
        let mut raw = record.to_raw(&context, None).expect("to_raw");
        raw.push(super::RawField {
            field_type: 0x7f,
            data: vec![1, 2, 3],
        });
        let (rebuilt, _) = Record::from_raw(&context, raw).expect("from_raw");
        assert_eq!(rebuilt.unknown_fields().len(), 1);
        assert_eq!(rebuilt.unknown_fields()[0].field_type, 0x7f);

        let raw_again = rebuilt.to_raw(&context, None).expect("to_raw");
        assert!(raw_again
            .iter()
            .any(|field| field.field_type == 0x7f && field.data == vec![1, 2, 3]));
    }

    #[test]
    fn dependent_password_slot_carries_the_reference() {
        let context = context();
        let record = Record::new().expect("record");
        let dependency = DependencyRef {
            base: Uuid::new_v4(),
            kind: DependencyKind::Alias,
        };
        let raw = record.to_raw(&context, Some(&dependency)).expect("to_raw");
        let (rebuilt, parsed) = Record::from_raw(&context, raw).expect("from_raw");
        assert_eq!(parsed, Some(dependency));
        assert_eq!(rebuilt.kind(), RecordKind::Alias);
        assert!(!rebuilt.has_password());
    }

    #[test]
    fn duplicate_gets_fresh_identity_but_shares_salt() {
        let context = context();
        let mut record = Record::new().expect("record");
        record.set_title(&context, "Original").expect("set");
        let copy = record.duplicate();
        assert_ne!(copy.uuid(), record.uuid());
        assert_eq!(copy.status(), RecordStatus::Added);
        // The copied sealed values stay readable because the salt came along.
        assert_eq!(copy.title(&context).expect("get"), "Original");
    }

    #[test]
    fn reference_syntax_roundtrips_and_rejects_noise() {
        let alias = DependencyRef {
            base: Uuid::new_v4(),
            kind: DependencyKind::Alias,
        };
        let shortcut = DependencyRef {
            base: Uuid::new_v4(),
            kind: DependencyKind::Shortcut,
        };
        assert_eq!(parse_reference(&format_reference(&alias)), Some(alias));
        assert_eq!(parse_reference(&format_reference(&shortcut)), Some(shortcut));
        assert_eq!(parse_reference("ordinary password"), None);
        assert_eq!(parse_reference("[[tooshort]]"), None);
        assert_eq!(parse_reference("[~00000000000000000000000000000000]]"), None);
    }
}
