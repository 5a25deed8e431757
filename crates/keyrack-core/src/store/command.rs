use uuid::Uuid;

use crate::record::{DependencyKind, Record};

/// A reversible mutation. Commands are self-contained values: everything
/// needed to apply or revert one is captured at construction, so the redo
/// tail can be discarded and rebuilt without dangling references.
#[derive(Debug, Clone)]
pub enum Command {
    Insert {
        record: Record,
    },
    /// Remove a record together with its dependents, atomically. The captured
    /// dependents all pointed at the removed record.
    RemoveCascade {
        record: Record,
        dependents: Vec<(Record, DependencyKind)>,
    },
    Update {
        before: Box<Record>,
        after: Box<Record>,
    },
    SetDependent {
        dependent: Uuid,
        base: Uuid,
        kind: DependencyKind,
    },
    RemoveDependent {
        dependent: Uuid,
        base: Uuid,
        kind: DependencyKind,
    },
    /// Several mutations applied as one undo step, e.g. a validation sweep.
    Group {
        description: String,
        commands: Vec<Command>,
    },
}

/// The linear command history: executed commands left of the cursor, redoable
/// commands right of it. Executing anything new truncates the redo tail.
#[derive(Debug, Default)]
pub struct CommandLog {
    entries: Vec<Command>,
    cursor: usize,
}

impl CommandLog {
    pub fn push(&mut self, command: Command) {
        self.entries.truncate(self.cursor);
        self.entries.push(command);
        self.cursor += 1;
    }

    #[must_use]
    pub fn undo_target(&self) -> Option<&Command> {
        self.cursor.checked_sub(1).map(|index| &self.entries[index])
    }

    #[must_use]
    pub fn redo_target(&self) -> Option<&Command> {
        self.entries.get(self.cursor)
    }

    pub fn retreat(&mut self) {
        debug_assert!(self.cursor > 0, "retreat past the start of the log");
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn advance(&mut self) {
        debug_assert!(self.cursor < self.entries.len(), "advance past the end of the log");
        self.cursor = (self.cursor + 1).min(self.entries.len());
    }

    #[must_use]
    pub fn any_to_undo(&self) -> bool {
        self.cursor > 0
    }

    #[must_use]
    pub fn any_to_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, CommandLog};
    use crate::record::Record;

    fn insert_command() -> Command {
        Command::Insert {
            record: Record::new().expect("record"),
        }
    }

    #[test]
    fn cursor_moves_through_undo_and_redo() {
        let mut log = CommandLog::default();
        assert!(!log.any_to_undo());
        assert!(!log.any_to_redo());

        log.push(insert_command());
        log.push(insert_command());
        assert!(log.any_to_undo());
        assert!(!log.any_to_redo());

        log.retreat();
        assert!(log.any_to_undo());
        assert!(log.any_to_redo());

        log.retreat();
        assert!(!log.any_to_undo());
        assert!(log.any_to_redo());

        log.advance();
        assert!(log.any_to_undo());
        assert!(log.any_to_redo());
    }

    #[test]
    fn executing_truncates_the_redo_tail() {
        let mut log = CommandLog::default();
        log.push(insert_command());
        log.push(insert_command());
        log.retreat();
        assert!(log.any_to_redo());

        log.push(insert_command());
        assert!(!log.any_to_redo());
        assert!(log.any_to_undo());
    }

    #[test]
    fn targets_follow_the_cursor() {
        let mut log = CommandLog::default();
        assert!(log.undo_target().is_none());
        assert!(log.redo_target().is_none());

        log.push(insert_command());
        assert!(log.undo_target().is_some());
        assert!(log.redo_target().is_none());

        log.retreat();
        assert!(log.undo_target().is_none());
        assert!(log.redo_target().is_some());
    }
}
