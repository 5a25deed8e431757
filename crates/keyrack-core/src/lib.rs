pub mod cipher;
pub mod field;
pub mod file;
pub mod history;
pub mod kdf;
pub mod policy;
pub mod record;
pub mod session;
pub mod store;

pub const APP_NAME: &str = "keyrack";

pub use cipher::{BlockCipher, CipherAlgorithm, CipherError};
pub use field::{FieldError, SealedField};
pub use file::{
    ContainerError, ContainerReader, ContainerWriter, DatabaseHeader, ReadOptions,
    CURRENT_VERSION, LEGACY_VERSION,
};
pub use history::{HistoryEntry, HistoryError, PasswordHistory, MAX_HISTORY_ENTRIES};
pub use kdf::{
    stretch, verification_tag, verify, KdfError, StretchedKey, DEFAULT_STRETCH_ITERATIONS,
    MAX_STRETCH_ITERATIONS, MIN_STRETCH_ITERATIONS,
};
pub use policy::{PasswordPolicy, PolicyError};
pub use record::{
    DependencyKind, DependencyRef, RawField, RawRecord, Record, RecordError, RecordKind,
    RecordStatus, UnknownField,
};
pub use session::{SessionContext, SessionError};
pub use store::{
    Command, EntryStore, FixMode, ImportSummary, LoadOptions, LoadReport, NamedPolicy,
    StoreError, StoreEvent, ValidationLimits, ValidationReport, MISSING_PASSWORD_SENTINEL,
};

/// Stable result codes reported across the collaborator boundary. Shell
/// layers key their messaging off these rather than the error details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    CannotOpenFile,
    UnsupportedVersion,
    WrongVersion,
    NotThisFormat,
    WrongPassword,
    IntegrityFailure,
    EndOfFile,
    DuplicateUuid,
    ValidationIssuesFound,
}

impl From<&ContainerError> for StatusCode {
    fn from(error: &ContainerError) -> Self {
        match error {
            ContainerError::NotThisFormat => Self::NotThisFormat,
            ContainerError::UnsupportedVersion(_) => Self::UnsupportedVersion,
            ContainerError::WrongPassword => Self::WrongPassword,
            ContainerError::IntegrityFailure => Self::IntegrityFailure,
            ContainerError::Truncated(_) => Self::EndOfFile,
            ContainerError::Kdf(_) => Self::WrongVersion,
            _ => Self::CannotOpenFile,
        }
    }
}

impl From<&StoreError> for StatusCode {
    fn from(error: &StoreError) -> Self {
        match error {
            StoreError::DuplicateUuid(_) => Self::DuplicateUuid,
            StoreError::Container(inner) => Self::from(inner),
            _ => Self::ValidationIssuesFound,
        }
    }
}

impl LoadReport {
    /// The status a shell should surface after a successful load.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        let repaired = self.regenerated_uuids > 0
            || !self.repointed_dependents.is_empty()
            || !self.orphaned_dependents.is_empty()
            || !self.validation.is_clean();
        if repaired {
            StatusCode::ValidationIssuesFound
        } else {
            StatusCode::Success
        }
    }
}
