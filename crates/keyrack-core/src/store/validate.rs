use std::collections::{HashMap, HashSet};

use serde::Serialize;
use url::Url;
use uuid::Uuid;

use super::{Command, EntryStore, StoreError, StoreEvent};
use crate::history::PasswordHistory;

pub const MISSING_PASSWORD_SENTINEL: &str = "[missing password]";
const PLACEHOLDER_TITLE_STEM: &str = "Unnamed entry";

/// How validation fixes reach the store: directly during initial load, or
/// through the command layer so an interactive caller can undo the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixMode {
    Direct,
    Logged,
}

#[derive(Debug, Clone)]
pub struct ValidationLimits {
    /// Field lengths beyond this are flagged for the display layer.
    pub max_field_length: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_field_length: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OversizeField {
    pub uuid: Uuid,
    pub field: &'static str,
    pub length: usize,
}

/// What a validation sweep found. The first four lists are fixes that were
/// applied; the last two are advisory flags left for the caller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub synthesized_titles: Vec<Uuid>,
    pub sentinel_passwords: Vec<Uuid>,
    pub retitled_duplicates: Vec<Uuid>,
    pub rewritten_histories: Vec<Uuid>,
    pub oversize_fields: Vec<OversizeField>,
    pub malformed_urls: Vec<Uuid>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.fixes_applied() == 0
            && self.oversize_fields.is_empty()
            && self.malformed_urls.is_empty()
    }

    #[must_use]
    pub fn fixes_applied(&self) -> usize {
        self.synthesized_titles.len()
            + self.sentinel_passwords.len()
            + self.retitled_duplicates.len()
            + self.rewritten_histories.len()
    }
}

#[derive(Debug, Default, Clone)]
struct PendingFix {
    title: Option<String>,
    password: Option<String>,
    history: Option<String>,
}

impl PendingFix {
    fn is_empty(&self) -> bool {
        self.title.is_none() && self.password.is_none() && self.history.is_none()
    }
}

impl EntryStore {
    /// Check and repair every record: empty titles get disambiguated
    /// placeholders, empty passwords a sentinel, colliding
    /// (group, title, user) triples a numeric suffix, malformed history
    /// strings are cleared, and oversize or unparseable display fields are
    /// flagged. Running it twice yields an empty second report.
    pub fn validate_all(
        &mut self,
        limits: &ValidationLimits,
        mode: FixMode,
    ) -> Result<ValidationReport, StoreError> {
        let mut report = ValidationReport::default();
        let uuids = self.sorted_uuids();
        let mut fixes: HashMap<Uuid, PendingFix> = HashMap::new();
        let mut placeholder_index = 0_usize;

        for uuid in &uuids {
            let record = &self.records[uuid];
            let mut fix = PendingFix::default();

            let title = record.title(self.context)?;
            if title.is_empty() {
                placeholder_index += 1;
                fix.title = Some(format!("{PLACEHOLDER_TITLE_STEM} {placeholder_index}"));
                report.synthesized_titles.push(*uuid);
            }

            if !record.kind().is_dependent() && record.password(self.context)?.is_empty() {
                fix.password = Some(MISSING_PASSWORD_SENTINEL.to_owned());
                report.sentinel_passwords.push(*uuid);
            }

            let history = record.history(self.context)?;
            if !history.is_empty() && PasswordHistory::decode(&history).is_err() {
                fix.history = Some(String::new());
                report.rewritten_histories.push(*uuid);
            }

            for (field, value) in [
                ("group", record.group(self.context)?),
                ("title", title),
                ("username", record.username(self.context)?),
                ("url", record.url(self.context)?),
                ("email", record.email(self.context)?),
            ] {
                if value.len() > limits.max_field_length {
                    report.oversize_fields.push(OversizeField {
                        uuid: *uuid,
                        field,
                        length: value.len(),
                    });
                }
            }

            let url = record.url(self.context)?;
            if !url.is_empty() && Url::parse(&url).is_err() {
                report.malformed_urls.push(*uuid);
            }

            if !fix.is_empty() {
                fixes.insert(*uuid, fix);
            }
        }

        self.deduplicate_triples(&uuids, &mut fixes, &mut report)?;
        self.apply_fixes(&uuids, fixes, mode)?;
        Ok(report)
    }

    /// Enforce unique (group, title, username) triples by suffixing titles,
    /// taking pending title fixes into account.
    fn deduplicate_triples(
        &self,
        uuids: &[Uuid],
        fixes: &mut HashMap<Uuid, PendingFix>,
        report: &mut ValidationReport,
    ) -> Result<(), StoreError> {
        let mut effective: Vec<(Uuid, String, String, String)> = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            let record = &self.records[uuid];
            let title = match fixes.get(uuid).and_then(|fix| fix.title.clone()) {
                Some(title) => title,
                None => record.title(self.context)?,
            };
            effective.push((
                *uuid,
                record.group(self.context)?,
                title,
                record.username(self.context)?,
            ));
        }

        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        for (uuid, group, title, username) in &effective {
            let mut candidate = title.clone();
            let mut suffix = 1_usize;
            while !seen.insert((group.clone(), candidate.clone(), username.clone())) {
                suffix += 1;
                candidate = format!("{title} #{suffix}");
            }
            if candidate != *title {
                fixes.entry(*uuid).or_default().title = Some(candidate);
                report.retitled_duplicates.push(*uuid);
            }
        }
        Ok(())
    }

    fn apply_fixes(
        &mut self,
        uuids: &[Uuid],
        fixes: HashMap<Uuid, PendingFix>,
        mode: FixMode,
    ) -> Result<(), StoreError> {
        if fixes.is_empty() {
            return Ok(());
        }
        match mode {
            FixMode::Direct => {
                for uuid in uuids {
                    let Some(fix) = fixes.get(uuid) else { continue };
                    let record = self
                        .records
                        .get_mut(uuid)
                        .ok_or(StoreError::UnknownUuid(*uuid))?;
                    if let Some(title) = &fix.title {
                        record.set_title(self.context, title)?;
                    }
                    if let Some(password) = &fix.password {
                        record.set_password(self.context, password)?;
                    }
                    if let Some(history) = &fix.history {
                        record.set_history(self.context, history)?;
                    }
                    self.touch();
                    self.notify(StoreEvent::RecordChanged(*uuid));
                }
                Ok(())
            }
            FixMode::Logged => {
                let mut commands = Vec::new();
                for uuid in uuids {
                    let Some(fix) = fixes.get(uuid) else { continue };
                    let before = self.records[uuid].clone();
                    let mut after = before.clone();
                    if let Some(title) = &fix.title {
                        after.set_title(self.context, title)?;
                    }
                    if let Some(password) = &fix.password {
                        after.set_password(self.context, password)?;
                    }
                    if let Some(history) = &fix.history {
                        after.set_history(self.context, history)?;
                    }
                    commands.push(Command::Update {
                        before: Box::new(before),
                        after: Box::new(after),
                    });
                }
                self.execute(Command::Group {
                    description: "validation fixes".to_owned(),
                    commands,
                })
            }
        }
    }
}
