use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use uuid::Uuid;

use crate::file::{
    ContainerError, ContainerReader, ContainerWriter, DatabaseHeader, ReadOptions, CURRENT_VERSION,
};
use crate::policy::PasswordPolicy;
use crate::record::{
    format_reference, DependencyKind, DependencyRef, Record, RecordError, RecordKind, RecordStatus,
};
use crate::session::SessionContext;

pub mod command;
pub mod validate;

pub use command::{Command, CommandLog};
pub use validate::{
    FixMode, OversizeField, ValidationLimits, ValidationReport, MISSING_PASSWORD_SENTINEL,
};

const EXPORT_COLUMNS: &str = "group\ttitle\tusername\tpassword\turl\tnotes\temail";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate uuid {0}")]
    DuplicateUuid(Uuid),
    #[error("unknown uuid {0}")]
    UnknownUuid(Uuid),
    #[error("record {0} still has {1} dependents")]
    HasDependents(Uuid, usize),
    #[error("record {0} is already a dependent")]
    AlreadyDependent(Uuid),
    #[error("record {0} is not a dependent")]
    NotDependent(Uuid),
    #[error("no policy named `{0}`")]
    UnknownPolicy(String),
    #[error("record {0} cannot serve as the base of this dependency")]
    InvalidBase(Uuid),
    #[error("policy `{0}` is referenced by {1} records")]
    PolicyInUse(String, usize),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Container(#[from] ContainerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    RecordAdded(Uuid),
    RecordRemoved(Uuid),
    RecordChanged(Uuid),
    DatabaseModified,
}

pub type Observer = Box<dyn Fn(&StoreEvent)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPolicy {
    pub policy: PasswordPolicy,
    pub use_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub read: ReadOptions,
    pub limits: ValidationLimits,
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub regenerated_uuids: usize,
    pub repointed_dependents: Vec<Uuid>,
    pub orphaned_dependents: Vec<Uuid>,
    pub validation: ValidationReport,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

/// The in-memory database: the UUID-keyed record collection, the
/// alias/shortcut dependency graph, named policies, group bookkeeping and
/// the undo/redo log. One instance per open database, single-writer.
pub struct EntryStore {
    context: &'static SessionContext,
    records: HashMap<Uuid, Record>,
    dependents: HashMap<Uuid, DependencyRef>,
    base_index: HashMap<Uuid, BTreeSet<Uuid>>,
    group_counts: HashMap<String, usize>,
    empty_groups: BTreeSet<String>,
    policies: HashMap<String, NamedPolicy>,
    header: DatabaseHeader,
    log: CommandLog,
    observers: Vec<Observer>,
    modified: bool,
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("context", &self.context)
            .field("records", &self.records)
            .field("dependents", &self.dependents)
            .field("base_index", &self.base_index)
            .field("group_counts", &self.group_counts)
            .field("empty_groups", &self.empty_groups)
            .field("policies", &self.policies)
            .field("header", &self.header)
            .field("log", &self.log)
            .field("observers", &self.observers.len())
            .field("modified", &self.modified)
            .finish()
    }
}

impl EntryStore {
    #[must_use]
    pub fn new(context: &'static SessionContext) -> Self {
        Self {
            context,
            records: HashMap::new(),
            dependents: HashMap::new(),
            base_index: HashMap::new(),
            group_counts: HashMap::new(),
            empty_groups: BTreeSet::new(),
            policies: HashMap::new(),
            header: DatabaseHeader::default(),
            log: CommandLog::default(),
            observers: Vec::new(),
            modified: false,
        }
    }

    #[must_use]
    pub fn context(&self) -> &'static SessionContext {
        self.context
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, uuid: &Uuid) -> Option<&Record> {
        self.records.get(uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Record UUIDs in a stable order.
    #[must_use]
    pub fn sorted_uuids(&self) -> Vec<Uuid> {
        let mut uuids: Vec<Uuid> = self.records.keys().copied().collect();
        uuids.sort_unstable();
        uuids
    }

    #[must_use]
    pub fn header(&self) -> &DatabaseHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut DatabaseHeader {
        self.touch();
        &mut self.header
    }

    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn subscribe(&mut self, observer: Observer) {
        self.observers.push(observer);
    }

    /// Insert a record under its own UUID. The caller resolves UUID
    /// collisions; only bulk load regenerates them silently.
    pub fn insert(&mut self, record: Record) -> Result<(), StoreError> {
        let uuid = record.uuid();
        if self.records.contains_key(&uuid) {
            return Err(StoreError::DuplicateUuid(uuid));
        }
        let group = record.group(self.context)?;
        let policy_name = record.policy_name(self.context)?;
        self.records.insert(uuid, record);
        self.enter_group(&group);
        self.reference_policy(&policy_name);
        self.touch();
        self.notify(StoreEvent::RecordAdded(uuid));
        Ok(())
    }

    /// Replace an existing record wholesale, keeping graph edges intact.
    pub fn update(&mut self, record: Record) -> Result<(), StoreError> {
        let uuid = record.uuid();
        let Some(existing) = self.records.get(&uuid) else {
            return Err(StoreError::UnknownUuid(uuid));
        };
        let old_group = existing.group(self.context)?;
        let old_policy = existing.policy_name(self.context)?;
        let new_group = record.group(self.context)?;
        let new_policy = record.policy_name(self.context)?;

        let mut record = record;
        record.set_kind(self.records[&uuid].kind());
        self.records.insert(uuid, record);

        if old_group != new_group {
            self.leave_group(&old_group);
            self.enter_group(&new_group);
        }
        if old_policy != new_policy {
            self.release_policy(&old_policy);
            self.reference_policy(&new_policy);
        }
        self.touch();
        self.notify(StoreEvent::RecordChanged(uuid));
        Ok(())
    }

    /// Remove one record. Fails while dependents still point at it; the
    /// cascade lives in [`Command::RemoveCascade`], which detaches them
    /// first as a single undoable step.
    pub fn remove(&mut self, uuid: Uuid) -> Result<Record, StoreError> {
        if !self.records.contains_key(&uuid) {
            return Err(StoreError::UnknownUuid(uuid));
        }
        if let Some(set) = self.base_index.get(&uuid) {
            if !set.is_empty() {
                return Err(StoreError::HasDependents(uuid, set.len()));
            }
        }
        let _ = self.detach_dependent(uuid);
        let record = self
            .records
            .remove(&uuid)
            .ok_or(StoreError::UnknownUuid(uuid))?;
        let group = record.group(self.context)?;
        let policy_name = record.policy_name(self.context)?;
        self.leave_group(&group);
        self.release_policy(&policy_name);
        self.touch();
        self.notify(StoreEvent::RecordRemoved(uuid));
        Ok(record)
    }

    /// Make `dependent` an alias or shortcut of `base`. The base must be a
    /// Normal record or already the matching base kind; chains are rejected
    /// here and only ever resolved during bulk load.
    pub fn set_dependent(
        &mut self,
        dependent: Uuid,
        base: Uuid,
        kind: DependencyKind,
    ) -> Result<(), StoreError> {
        if dependent == base {
            return Err(StoreError::InvalidBase(base));
        }
        if !self.records.contains_key(&dependent) {
            return Err(StoreError::UnknownUuid(dependent));
        }
        if self.dependents.contains_key(&dependent) {
            return Err(StoreError::AlreadyDependent(dependent));
        }
        if let Some(set) = self.base_index.get(&dependent) {
            if !set.is_empty() {
                return Err(StoreError::HasDependents(dependent, set.len()));
            }
        }
        let base_record = self
            .records
            .get(&base)
            .ok_or(StoreError::UnknownUuid(base))?;
        let base_kind = match kind {
            DependencyKind::Alias => RecordKind::AliasBase,
            DependencyKind::Shortcut => RecordKind::ShortcutBase,
        };
        if base_record.kind() != RecordKind::Normal && base_record.kind() != base_kind {
            return Err(StoreError::InvalidBase(base));
        }

        self.dependents
            .insert(dependent, DependencyRef { base, kind });
        self.base_index.entry(base).or_default().insert(dependent);
        if let Some(record) = self.records.get_mut(&base) {
            record.set_kind(base_kind);
        }
        if let Some(record) = self.records.get_mut(&dependent) {
            record.set_kind(match kind {
                DependencyKind::Alias => RecordKind::Alias,
                DependencyKind::Shortcut => RecordKind::Shortcut,
            });
        }
        self.touch();
        self.notify(StoreEvent::RecordChanged(dependent));
        self.notify(StoreEvent::RecordChanged(base));
        Ok(())
    }

    /// Detach a dependent from its base. The base reverts to Normal when its
    /// last dependent goes.
    pub fn remove_dependent(&mut self, dependent: Uuid) -> Result<DependencyRef, StoreError> {
        if !self.records.contains_key(&dependent) {
            return Err(StoreError::UnknownUuid(dependent));
        }
        let Some(reference) = self.detach_dependent(dependent) else {
            return Err(StoreError::NotDependent(dependent));
        };
        self.touch();
        self.notify(StoreEvent::RecordChanged(dependent));
        self.notify(StoreEvent::RecordChanged(reference.base));
        Ok(reference)
    }

    #[must_use]
    pub fn base_of(&self, uuid: &Uuid) -> Option<DependencyRef> {
        self.dependents.get(uuid).copied()
    }

    #[must_use]
    pub fn dependents_of(&self, uuid: &Uuid) -> Vec<Uuid> {
        self.base_index
            .get(uuid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn empty_groups(&self) -> &BTreeSet<String> {
        &self.empty_groups
    }

    /// Register a group path with no records yet, e.g. one just created in
    /// the tree view.
    pub fn note_empty_group(&mut self, path: &str) {
        if !path.is_empty() && !self.group_counts.contains_key(path) {
            self.empty_groups.insert(path.to_owned());
            self.touch();
        }
    }

    pub fn define_policy(&mut self, name: &str, policy: PasswordPolicy) -> Result<(), StoreError> {
        policy.validate().map_err(RecordError::from)?;
        let use_count = self
            .policies
            .get(name)
            .map(|named| named.use_count)
            .unwrap_or(0);
        self.policies
            .insert(name.to_owned(), NamedPolicy { policy, use_count });
        self.touch();
        Ok(())
    }

    pub fn remove_policy(&mut self, name: &str) -> Result<PasswordPolicy, StoreError> {
        match self.policies.get(name) {
            None => Err(StoreError::UnknownPolicy(name.to_owned())),
            Some(named) if named.use_count > 0 => {
                Err(StoreError::PolicyInUse(name.to_owned(), named.use_count))
            }
            Some(_) => {
                let named = self
                    .policies
                    .remove(name)
                    .ok_or_else(|| StoreError::UnknownPolicy(name.to_owned()))?;
                self.touch();
                Ok(named.policy)
            }
        }
    }

    #[must_use]
    pub fn policy(&self, name: &str) -> Option<&NamedPolicy> {
        self.policies.get(name)
    }

    #[must_use]
    pub fn policies(&self) -> &HashMap<String, NamedPolicy> {
        &self.policies
    }

    /// Run a command and append it to the history, discarding any redo tail.
    pub fn execute(&mut self, command: Command) -> Result<(), StoreError> {
        self.apply(&command)?;
        self.log.push(command);
        Ok(())
    }

    /// Reverse the command left of the cursor. `Ok(false)` when there is
    /// nothing to undo.
    pub fn undo(&mut self) -> Result<bool, StoreError> {
        let Some(command) = self.log.undo_target().cloned() else {
            return Ok(false);
        };
        self.revert(&command)?;
        self.log.retreat();
        Ok(true)
    }

    /// Re-apply the command right of the cursor. `Ok(false)` when there is
    /// nothing to redo.
    pub fn redo(&mut self) -> Result<bool, StoreError> {
        let Some(command) = self.log.redo_target().cloned() else {
            return Ok(false);
        };
        self.apply(&command)?;
        self.log.advance();
        Ok(true)
    }

    #[must_use]
    pub fn any_to_undo(&self) -> bool {
        self.log.any_to_undo()
    }

    #[must_use]
    pub fn any_to_redo(&self) -> bool {
        self.log.any_to_redo()
    }

    /// Capture the cascade command that removes `uuid` and every dependent
    /// pointing at it as one undoable step.
    pub fn remove_command(&self, uuid: Uuid) -> Result<Command, StoreError> {
        let record = self
            .records
            .get(&uuid)
            .ok_or(StoreError::UnknownUuid(uuid))?
            .clone();
        let mut dependents = Vec::new();
        for dependent in self.dependents_of(&uuid) {
            let reference = self.dependents[&dependent];
            dependents.push((self.records[&dependent].clone(), reference.kind));
        }
        Ok(Command::RemoveCascade { record, dependents })
    }

    fn apply(&mut self, command: &Command) -> Result<(), StoreError> {
        match command {
            Command::Insert { record } => self.insert(record.clone()),
            Command::RemoveCascade { record, dependents } => {
                for (dependent, _) in dependents {
                    self.remove(dependent.uuid())?;
                }
                self.remove(record.uuid())?;
                Ok(())
            }
            Command::Update { after, .. } => self.update((**after).clone()),
            Command::SetDependent {
                dependent,
                base,
                kind,
            } => self.set_dependent(*dependent, *base, *kind),
            Command::RemoveDependent { dependent, .. } => {
                self.remove_dependent(*dependent).map(|_| ())
            }
            Command::Group { commands, .. } => {
                for command in commands {
                    self.apply(command)?;
                }
                Ok(())
            }
        }
    }

    fn revert(&mut self, command: &Command) -> Result<(), StoreError> {
        match command {
            Command::Insert { record } => self.remove(record.uuid()).map(|_| ()),
            Command::RemoveCascade { record, dependents } => {
                let base = record.uuid();
                self.insert(record.clone())?;
                for (dependent, kind) in dependents {
                    self.insert(dependent.clone())?;
                    self.set_dependent(dependent.uuid(), base, *kind)?;
                }
                Ok(())
            }
            Command::Update { before, .. } => self.update((**before).clone()),
            Command::SetDependent { dependent, .. } => {
                self.remove_dependent(*dependent).map(|_| ())
            }
            Command::RemoveDependent {
                dependent,
                base,
                kind,
            } => self.set_dependent(*dependent, *base, *kind),
            Command::Group { commands, .. } => {
                for command in commands.iter().rev() {
                    self.revert(command)?;
                }
                Ok(())
            }
        }
    }

    /// Read an entire container. Invariant violations (nil or duplicate
    /// UUIDs, dangling or chained dependencies) are repaired and reported
    /// rather than aborting; integrity and format failures abort with the
    /// store untouched.
    pub fn load(
        context: &'static SessionContext,
        bytes: &[u8],
        passphrase: &str,
        options: &LoadOptions,
    ) -> Result<(Self, LoadReport), StoreError> {
        let mut reader = ContainerReader::open(bytes, passphrase, options.read.clone())?;
        let mut loaded = Vec::new();
        while let Some(raw) = reader.read_record()? {
            loaded.push(Record::from_raw(context, raw)?);
        }
        let header = reader.header().clone();
        reader.finish()?;

        let mut store = Self::new(context);
        store.header = header;
        let mut report = LoadReport::default();

        let mut references: Vec<(Uuid, DependencyRef)> = Vec::new();
        for (mut record, dependency) in loaded {
            if record.uuid().is_nil() || store.records.contains_key(&record.uuid()) {
                record.set_uuid(Uuid::new_v4());
                report.regenerated_uuids += 1;
            }
            record.set_status(RecordStatus::Clean);
            let uuid = record.uuid();
            store.insert(record)?;
            if let Some(reference) = dependency {
                references.push((uuid, reference));
            }
        }

        store.link_loaded_dependencies(references, &mut report);
        report.validation = store.validate_all(&options.limits, FixMode::Direct)?;

        // The store only counts as modified when load had to repair it.
        store.modified = report.regenerated_uuids > 0
            || !report.repointed_dependents.is_empty()
            || !report.orphaned_dependents.is_empty()
            || report.validation.fixes_applied() > 0;
        store.log.clear();
        Ok((store, report))
    }

    /// Serialize to container bytes. Statuses reset to Clean and the
    /// modified flag clears only after the writer finishes, so a failed
    /// save leaves the store state intact.
    pub fn save(&mut self, passphrase: &str, iterations: u32) -> Result<Vec<u8>, StoreError> {
        self.header.format_version = CURRENT_VERSION;
        self.header.last_saved_at = unix_seconds_now();
        let mut writer = ContainerWriter::new(passphrase, iterations, &self.header)?;
        for uuid in self.sorted_uuids() {
            let record = &self.records[&uuid];
            let dependency = self.dependents.get(&uuid);
            let raw = record.to_raw(self.context, dependency)?;
            writer.write_record(&raw)?;
        }
        let bytes = writer.finish()?;
        for record in self.records.values_mut() {
            record.set_status(RecordStatus::Clean);
        }
        self.modified = false;
        Ok(bytes)
    }

    /// Tab-delimited plaintext rows for the import/export collaborators.
    /// Alias and shortcut password cells carry the base reference text.
    pub fn export_delimited(&self) -> Result<String, StoreError> {
        let mut out = String::from(EXPORT_COLUMNS);
        out.push('\n');
        for uuid in self.sorted_uuids() {
            let record = &self.records[&uuid];
            let password = match self.dependents.get(&uuid) {
                Some(reference) => format_reference(reference),
                None => record.password(self.context)?,
            };
            let columns = [
                record.group(self.context)?,
                record.title(self.context)?,
                record.username(self.context)?,
                password,
                record.url(self.context)?,
                record.notes(self.context)?,
                record.email(self.context)?,
            ];
            let escaped: Vec<String> = columns.iter().map(|value| escape_cell(value)).collect();
            out.push_str(&escaped.join("\t"));
            out.push('\n');
        }
        Ok(out)
    }

    /// Inverse of [`export_delimited`]: each data row becomes a fresh record
    /// under a new UUID. Rows without a title are skipped and counted.
    pub fn import_delimited(&mut self, text: &str) -> Result<ImportSummary, StoreError> {
        let mut summary = ImportSummary::default();
        for (index, line) in text.lines().enumerate() {
            if line.is_empty() || (index == 0 && line == EXPORT_COLUMNS) {
                continue;
            }
            let cells: Vec<String> = line.split('\t').map(unescape_cell).collect();
            let title = cells.get(1).cloned().unwrap_or_default();
            if title.is_empty() {
                summary.skipped += 1;
                continue;
            }
            let mut record = Record::new()?;
            record.set_group(self.context, cells.first().map_or("", String::as_str))?;
            record.set_title(self.context, &title)?;
            record.set_username(self.context, cells.get(2).map_or("", String::as_str))?;
            record.set_password(self.context, cells.get(3).map_or("", String::as_str))?;
            record.set_url(self.context, cells.get(4).map_or("", String::as_str))?;
            record.set_notes(self.context, cells.get(5).map_or("", String::as_str))?;
            record.set_email(self.context, cells.get(6).map_or("", String::as_str))?;
            record.set_created_at(self.context, Some(unix_seconds_now()))?;
            self.insert(record)?;
            summary.imported += 1;
        }
        Ok(summary)
    }

    /// Drop everything; used when the database closes.
    pub fn clear(&mut self) {
        self.records.clear();
        self.dependents.clear();
        self.base_index.clear();
        self.group_counts.clear();
        self.empty_groups.clear();
        self.policies.clear();
        self.header = DatabaseHeader::default();
        self.log.clear();
        self.modified = false;
    }

    fn link_loaded_dependencies(
        &mut self,
        mut references: Vec<(Uuid, DependencyRef)>,
        report: &mut LoadReport,
    ) {
        references.sort_unstable_by_key(|(uuid, _)| *uuid);
        let forward: HashMap<Uuid, DependencyRef> = references.iter().copied().collect();

        for (dependent, reference) in &references {
            let mut base = reference.base;
            let mut seen: HashSet<Uuid> = HashSet::from([*dependent]);
            let mut cycle = false;
            while let Some(next) = forward.get(&base) {
                if !seen.insert(base) {
                    cycle = true;
                    break;
                }
                base = next.base;
            }

            if cycle || !self.records.contains_key(&base) {
                self.demote_to_normal(*dependent);
                report.orphaned_dependents.push(*dependent);
                continue;
            }
            match self.set_dependent(*dependent, base, reference.kind) {
                Ok(()) => {
                    if base != reference.base {
                        report.repointed_dependents.push(*dependent);
                    }
                }
                Err(_) => {
                    self.demote_to_normal(*dependent);
                    report.orphaned_dependents.push(*dependent);
                }
            }
        }
    }

    fn demote_to_normal(&mut self, uuid: Uuid) {
        if let Some(record) = self.records.get_mut(&uuid) {
            record.set_kind(RecordKind::Normal);
        }
    }

    fn detach_dependent(&mut self, dependent: Uuid) -> Option<DependencyRef> {
        let reference = self.dependents.remove(&dependent)?;
        if let Some(set) = self.base_index.get_mut(&reference.base) {
            set.remove(&dependent);
            if set.is_empty() {
                self.base_index.remove(&reference.base);
                if let Some(record) = self.records.get_mut(&reference.base) {
                    record.set_kind(RecordKind::Normal);
                }
            }
        }
        if let Some(record) = self.records.get_mut(&dependent) {
            record.set_kind(RecordKind::Normal);
        }
        Some(reference)
    }

    fn enter_group(&mut self, group: &str) {
        if group.is_empty() {
            return;
        }
        *self.group_counts.entry(group.to_owned()).or_default() += 1;
        self.empty_groups.remove(group);
    }

    fn leave_group(&mut self, group: &str) {
        if group.is_empty() {
            return;
        }
        if let Some(count) = self.group_counts.get_mut(group) {
            *count -= 1;
            if *count == 0 {
                self.group_counts.remove(group);
                self.empty_groups.insert(group.to_owned());
            }
        }
    }

    fn reference_policy(&mut self, name: &str) {
        if name.is_empty() {
            return;
        }
        if let Some(named) = self.policies.get_mut(name) {
            named.use_count += 1;
        }
    }

    fn release_policy(&mut self, name: &str) {
        if name.is_empty() {
            return;
        }
        if let Some(named) = self.policies.get_mut(name) {
            named.use_count = named.use_count.saturating_sub(1);
        }
    }

    fn touch(&mut self) {
        if !self.modified {
            self.modified = true;
            self.notify(StoreEvent::DatabaseModified);
        }
    }

    fn notify(&self, event: StoreEvent) {
        for observer in &self.observers {
            observer(&event);
        }
    }
}

fn escape_cell(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_cell(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use uuid::Uuid;

    use super::{
        escape_cell, unescape_cell, Command, EntryStore, StoreError, StoreEvent,
    };
    use crate::policy::PasswordPolicy;
    use crate::record::{DependencyKind, Record, RecordKind};
    use crate::session::SessionContext;

    fn context() -> &'static SessionContext {
        match SessionContext::initialize() {
            Ok(context) => context,
            Err(_) => SessionContext::current().expect("session context"),
        }
    }

    fn record(store: &EntryStore, title: &str, password: &str) -> Record {
        let mut record = Record::new().expect("record");
        record.set_title(store.context(), title).expect("set");
        record.set_password(store.context(), password).expect("set");
        record
    }

    #[test]
    fn insert_rejects_duplicate_uuid() {
        let mut store = EntryStore::new(context());
        let original = record(&store, "One", "pw");
        let mut clone = original.clone();
        clone.set_status(crate::record::RecordStatus::Added);
        store.insert(original).expect("insert");
        assert!(matches!(
            store.insert(clone),
            Err(StoreError::DuplicateUuid(_))
        ));
    }

    #[test]
    fn dependency_graph_stays_symmetric() {
        let mut store = EntryStore::new(context());
        let base = record(&store, "Base", "pw");
        let alias_one = record(&store, "Alias one", "");
        let alias_two = record(&store, "Alias two", "");
        let (base_id, one_id, two_id) = (base.uuid(), alias_one.uuid(), alias_two.uuid());
        store.insert(base).expect("insert");
        store.insert(alias_one).expect("insert");
        store.insert(alias_two).expect("insert");

        store
            .set_dependent(one_id, base_id, DependencyKind::Alias)
            .expect("set dependent");
        store
            .set_dependent(two_id, base_id, DependencyKind::Alias)
            .expect("set dependent");

        assert_eq!(store.get(&base_id).expect("base").kind(), RecordKind::AliasBase);
        assert_eq!(store.get(&one_id).expect("alias").kind(), RecordKind::Alias);
        assert_eq!(store.dependents_of(&base_id), vec![one_id.min(two_id), one_id.max(two_id)]);
        assert_eq!(store.base_of(&one_id).expect("edge").base, base_id);

        store.remove_dependent(one_id).expect("remove dependent");
        assert_eq!(store.get(&base_id).expect("base").kind(), RecordKind::AliasBase);
        store.remove_dependent(two_id).expect("remove dependent");
        assert_eq!(store.get(&base_id).expect("base").kind(), RecordKind::Normal);
        assert!(store.dependents_of(&base_id).is_empty());
    }

    #[test]
    fn remove_refuses_while_dependents_remain() {
        let mut store = EntryStore::new(context());
        let base = record(&store, "Base", "pw");
        let alias = record(&store, "Alias", "");
        let (base_id, alias_id) = (base.uuid(), alias.uuid());
        store.insert(base).expect("insert");
        store.insert(alias).expect("insert");
        store
            .set_dependent(alias_id, base_id, DependencyKind::Alias)
            .expect("set dependent");

        assert!(matches!(
            store.remove(base_id),
            Err(StoreError::HasDependents(_, 1))
        ));
        store.remove_dependent(alias_id).expect("detach");
        store.remove(base_id).expect("remove succeeds once detached");
    }

    #[test]
    fn chained_dependencies_are_rejected_outside_load() {
        let mut store = EntryStore::new(context());
        let base = record(&store, "Base", "pw");
        let alias = record(&store, "Alias", "");
        let chained = record(&store, "Chained", "");
        let (base_id, alias_id, chained_id) = (base.uuid(), alias.uuid(), chained.uuid());
        store.insert(base).expect("insert");
        store.insert(alias).expect("insert");
        store.insert(chained).expect("insert");
        store
            .set_dependent(alias_id, base_id, DependencyKind::Alias)
            .expect("set dependent");

        // An alias cannot itself serve as a base.
        assert!(matches!(
            store.set_dependent(chained_id, alias_id, DependencyKind::Alias),
            Err(StoreError::InvalidBase(_))
        ));
        // A dependent cannot be re-pointed without detaching first.
        assert!(matches!(
            store.set_dependent(alias_id, chained_id, DependencyKind::Alias),
            Err(StoreError::AlreadyDependent(_))
        ));
        // A shortcut cannot target a record that is a base of aliases.
        assert!(matches!(
            store.set_dependent(chained_id, base_id, DependencyKind::Shortcut),
            Err(StoreError::InvalidBase(_))
        ));
    }

    #[test]
    fn execute_undo_redo_roundtrip() {
        let mut store = EntryStore::new(context());
        let entry = record(&store, "Mail", "pw");
        let uuid = entry.uuid();

        store.execute(Command::Insert { record: entry }).expect("execute");
        assert!(store.any_to_undo());
        assert!(!store.any_to_redo());
        assert!(store.get(&uuid).is_some());

        assert!(store.undo().expect("undo"));
        assert!(store.get(&uuid).is_none());
        assert!(store.any_to_redo());

        assert!(store.redo().expect("redo"));
        assert!(store.get(&uuid).is_some());
        assert!(!store.redo().expect("redo at the end is a no-op"));
    }

    #[test]
    fn new_command_discards_redo_tail() {
        let mut store = EntryStore::new(context());
        let first = record(&store, "First", "pw");
        let second = record(&store, "Second", "pw");
        store.execute(Command::Insert { record: first }).expect("execute");
        assert!(store.undo().expect("undo"));
        assert!(store.any_to_redo());

        store.execute(Command::Insert { record: second }).expect("execute");
        assert!(!store.any_to_redo());
    }

    #[test]
    fn cascade_removal_is_one_undoable_step() {
        let mut store = EntryStore::new(context());
        let base = record(&store, "Base", "pw");
        let alias = record(&store, "Alias", "");
        let (base_id, alias_id) = (base.uuid(), alias.uuid());
        store.insert(base).expect("insert");
        store.insert(alias).expect("insert");
        store
            .set_dependent(alias_id, base_id, DependencyKind::Alias)
            .expect("set dependent");

        let command = store.remove_command(base_id).expect("capture");
        store.execute(command).expect("execute");
        assert!(store.get(&base_id).is_none());
        assert!(store.get(&alias_id).is_none());

        assert!(store.undo().expect("undo"));
        assert!(store.get(&base_id).is_some());
        assert_eq!(store.get(&base_id).expect("base").kind(), RecordKind::AliasBase);
        assert_eq!(store.base_of(&alias_id).expect("edge").base, base_id);
    }

    #[test]
    fn update_command_restores_previous_values() {
        let mut store = EntryStore::new(context());
        let entry = record(&store, "Before", "pw");
        let uuid = entry.uuid();
        store.insert(entry.clone()).expect("insert");

        let mut after = entry.clone();
        after.set_title(store.context(), "After").expect("set");
        store
            .execute(Command::Update {
                before: Box::new(entry),
                after: Box::new(after),
            })
            .expect("execute");
        assert_eq!(
            store.get(&uuid).expect("record").title(store.context()).expect("title"),
            "After"
        );

        assert!(store.undo().expect("undo"));
        assert_eq!(
            store.get(&uuid).expect("record").title(store.context()).expect("title"),
            "Before"
        );
    }

    #[test]
    fn policy_reference_counts_follow_records() {
        let mut store = EntryStore::new(context());
        store
            .define_policy("login", PasswordPolicy::default())
            .expect("define");

        let mut entry = record(&store, "Mail", "pw");
        entry.set_policy_name(store.context(), "login").expect("set");
        let uuid = entry.uuid();
        store.insert(entry).expect("insert");
        assert_eq!(store.policy("login").expect("policy").use_count, 1);

        assert!(matches!(
            store.remove_policy("login"),
            Err(StoreError::PolicyInUse(_, 1))
        ));

        store.remove(uuid).expect("remove");
        assert_eq!(store.policy("login").expect("policy").use_count, 0);
        store.remove_policy("login").expect("removable once unused");
    }

    #[test]
    fn group_bookkeeping_tracks_emptied_groups() {
        let mut store = EntryStore::new(context());
        store.note_empty_group("Personal");
        assert!(store.empty_groups().contains("Personal"));

        let mut entry = record(&store, "Mail", "pw");
        entry.set_group(store.context(), "Personal").expect("set");
        let uuid = entry.uuid();
        store.insert(entry).expect("insert");
        assert!(!store.empty_groups().contains("Personal"));

        store.remove(uuid).expect("remove");
        assert!(store.empty_groups().contains("Personal"));
    }

    #[test]
    fn observers_receive_change_events() {
        let mut store = EntryStore::new(context());
        let seen: Rc<RefCell<Vec<StoreEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        store.subscribe(Box::new(move |event| sink.borrow_mut().push(*event)));

        let entry = record(&store, "Mail", "pw");
        let uuid = entry.uuid();
        store.insert(entry).expect("insert");
        store.remove(uuid).expect("remove");

        let events = seen.borrow();
        assert!(events.contains(&StoreEvent::DatabaseModified));
        assert!(events.contains(&StoreEvent::RecordAdded(uuid)));
        assert!(events.contains(&StoreEvent::RecordRemoved(uuid)));
    }

    #[test]
    fn delimited_cells_escape_and_unescape() {
        let nasty = "tab\there\nnewline\\backslash";
        assert_eq!(unescape_cell(&escape_cell(nasty)), nasty);
        assert!(!escape_cell(nasty).contains('\t'));
        assert!(!escape_cell(nasty).contains('\n'));
    }

    #[test]
    fn export_then_import_preserves_field_values() {
        let mut store = EntryStore::new(context());
        let mut entry = record(&store, "Mail", "pw\twith\ttabs");
        entry.set_group(store.context(), "Work").expect("set");
        entry.set_username(store.context(), "alice").expect("set");
        entry.set_notes(store.context(), "line one\nline two").expect("set");
        store.insert(entry).expect("insert");

        let exported = store.export_delimited().expect("export");

        let mut target = EntryStore::new(context());
        let summary = target.import_delimited(&exported).expect("import");
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.skipped, 0);

        let uuid = target.sorted_uuids()[0];
        let loaded = target.get(&uuid).expect("record");
        assert_eq!(loaded.group(target.context()).expect("group"), "Work");
        assert_eq!(loaded.title(target.context()).expect("title"), "Mail");
        assert_eq!(
            loaded.password(target.context()).expect("password"),
            "pw\twith\ttabs"
        );
        assert_eq!(
            loaded.notes(target.context()).expect("notes"),
            "line one\nline two"
        );
    }

    #[test]
    fn clear_resets_everything() {
        let mut store = EntryStore::new(context());
        store.insert(record(&store, "Mail", "pw")).expect("insert");
        store.note_empty_group("Personal");
        assert!(store.is_modified());

        store.clear();
        assert!(store.is_empty());
        assert!(store.empty_groups().is_empty());
        assert!(!store.is_modified());
        assert!(!store.any_to_undo());
    }

    #[test]
    fn unknown_uuid_paths_return_typed_errors() {
        let mut store = EntryStore::new(context());
        let ghost = Uuid::new_v4();
        assert!(matches!(store.remove(ghost), Err(StoreError::UnknownUuid(_))));
        assert!(matches!(
            store.remove_dependent(ghost),
            Err(StoreError::UnknownUuid(_))
        ));
        assert!(matches!(
            store.remove_policy("ghost"),
            Err(StoreError::UnknownPolicy(_))
        ));
    }
}
