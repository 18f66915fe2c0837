use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use num_enum::TryFromPrimitive;
use thiserror::Error;

use crate::records::{self, Record, RecordList};
use crate::write::{self, WriteFlags, WriteResults};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("record index {0} out of range, must be less than {1}")]
    BadRecordIndex(u64, usize),
    #[error("edit action expected at index {0}, found {1}")]
    BadEditAction(usize, u64),
    #[error(transparent)]
    Records(#[from] records::Error),
}

/// The editing actions a munging script can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u64)]
pub enum EditAction {
    AddBefore = 0,
    AddAfter = 1,
    Remove = 2,
    Replace = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Replacement {
    Removed,
    Replaced(Record),
}

/// A logically immutable base record list plus an edit overlay. Edits are
/// always keyed by an index into the base list, so successive edits never
/// shift each other; `remove` and `replace` at one index overwrite each
/// other, while insertions accumulate in insertion order.
pub struct MungedBitcode {
    base: Rc<RecordList>,
    before: HashMap<usize, Vec<Record>>,
    after: HashMap<usize, Vec<Record>>,
    replace: HashMap<usize, Replacement>,
}

impl MungedBitcode {
    pub fn new(base: RecordList) -> Self {
        Self::from_shared(Rc::new(base))
    }

    /// Share an existing base list; the overlay starts empty.
    pub fn from_shared(base: Rc<RecordList>) -> Self {
        Self {
            base,
            before: HashMap::new(),
            after: HashMap::new(),
            replace: HashMap::new(),
        }
    }

    /// Parse a binary stream into a munged bitcode with no edits.
    pub fn from_bitcode(bytes: &[u8]) -> Result<Self, records::Error> {
        Ok(Self::new(records::read_record_list(bytes)?))
    }

    pub fn base_records(&self) -> &RecordList {
        &self.base
    }

    pub fn shared_base(&self) -> Rc<RecordList> {
        Rc::clone(&self.base)
    }

    fn check_index(&self, index: usize) {
        assert!(
            index < self.base.len(),
            "edit index {index} out of range for {} base records",
            self.base.len()
        );
    }

    /// Insert `record` before the base record at `index`, after any
    /// records previously inserted there.
    pub fn add_before(&mut self, index: usize, record: Record) {
        self.check_index(index);
        self.before.entry(index).or_default().push(record);
    }

    /// Insert `record` after the base record at `index`.
    pub fn add_after(&mut self, index: usize, record: Record) {
        self.check_index(index);
        self.after.entry(index).or_default().push(record);
    }

    /// Drop the base record at `index`; undoes any earlier replace there.
    pub fn remove(&mut self, index: usize) {
        self.check_index(index);
        let _ = self.replace.insert(index, Replacement::Removed);
    }

    /// Substitute the base record at `index`; undoes any earlier remove.
    pub fn replace(&mut self, index: usize, record: Record) {
        self.check_index(index);
        let _ = self.replace.insert(index, Replacement::Replaced(record));
    }

    /// Clear the overlay, restoring the base list.
    pub fn remove_edits(&mut self) {
        self.before.clear();
        self.after.clear();
        self.replace.clear();
    }

    /// Apply a munging script: a flat u64 array of
    /// `RecordIndex, Action[, AbbrevIndex, Code, Values..., Terminator]`
    /// groups, where only `Remove` lacks the record tail.
    pub fn munge(&mut self, script: &[u64], terminator: u64) -> Result<(), Error> {
        let mut i = 0usize;
        while i < script.len() {
            let raw_index = script[i];
            i += 1;
            let index = usize::try_from(raw_index)
                .ok()
                .filter(|&v| v < self.base.len())
                .ok_or(Error::BadRecordIndex(raw_index, self.base.len()))?;
            let raw_action = *script.get(i).ok_or(Error::BadEditAction(i, terminator))?;
            i += 1;
            let action = EditAction::try_from(raw_action)
                .map_err(|_| Error::BadEditAction(i - 1, raw_action))?;
            match action {
                EditAction::Remove => self.remove(index),
                EditAction::AddBefore => {
                    let record = Record::read_from_array(script, terminator, &mut i)?;
                    self.add_before(index, record);
                }
                EditAction::AddAfter => {
                    let record = Record::read_from_array(script, terminator, &mut i)?;
                    self.add_after(index, record);
                }
                EditAction::Replace => {
                    let record = Record::read_from_array(script, terminator, &mut i)?;
                    self.replace(index, record);
                }
            }
        }
        Ok(())
    }

    /// Iterate the edited view in O(1) amortized steps.
    pub fn iter(&self) -> MungedIter<'_> {
        MungedIter {
            bitcode: self,
            index: 0,
            phase: Phase::Before,
            ins_pos: 0,
        }
    }

    /// Write the edited view as a bitstream.
    pub fn write(&self, add_header: bool, flags: WriteFlags) -> (Vec<u8>, WriteResults) {
        write::write_records(self.iter(), add_header, flags)
    }
}

impl fmt::Display for MungedBitcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut indent = 0usize;
        for record in self.iter() {
            if indent > 0 && record.is_exit_block() {
                indent -= 1;
            }
            for _ in 0..indent {
                f.write_str("  ")?;
            }
            writeln!(f, "{record}")?;
            if record.is_enter_block() {
                indent += 1;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Before,
    At,
    After,
}

/// Cursor over the edited view: `(base index, phase, insertion position)`.
pub struct MungedIter<'a> {
    bitcode: &'a MungedBitcode,
    index: usize,
    phase: Phase,
    ins_pos: usize,
}

impl<'a> Iterator for MungedIter<'a> {
    type Item = &'a Record;

    fn next(&mut self) -> Option<&'a Record> {
        loop {
            if self.index >= self.bitcode.base.len() {
                return None;
            }
            match self.phase {
                Phase::Before => {
                    if let Some(r) = self
                        .bitcode
                        .before
                        .get(&self.index)
                        .and_then(|l| l.get(self.ins_pos))
                    {
                        self.ins_pos += 1;
                        return Some(r);
                    }
                    self.phase = Phase::At;
                }
                Phase::At => {
                    self.phase = Phase::After;
                    self.ins_pos = 0;
                    match self.bitcode.replace.get(&self.index) {
                        Some(Replacement::Removed) => {}
                        Some(Replacement::Replaced(r)) => return Some(r),
                        None => return Some(&self.bitcode.base[self.index]),
                    }
                }
                Phase::After => {
                    if let Some(r) = self
                        .bitcode
                        .after
                        .get(&self.index)
                        .and_then(|l| l.get(self.ins_pos))
                    {
                        self.ins_pos += 1;
                        return Some(r);
                    }
                    self.index += 1;
                    self.phase = Phase::Before;
                    self.ins_pos = 0;
                }
            }
        }
    }
}

impl<'a> IntoIterator for &'a MungedBitcode {
    type Item = &'a Record;
    type IntoIter = MungedIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RecordList {
        vec![
            Record::unabbreviated(0, vec![]),
            Record::unabbreviated(1, vec![7]),
            Record::unabbreviated(2, vec![]),
        ]
    }

    fn codes(bitcode: &MungedBitcode) -> Vec<u64> {
        bitcode.iter().map(|r| r.code).collect()
    }

    #[test]
    fn empty_overlay_yields_base() {
        let bitcode = MungedBitcode::new(base());
        let collected: Vec<Record> = bitcode.iter().cloned().collect();
        assert_eq!(&collected, bitcode.base_records());
    }

    #[test]
    fn edits_compose_into_the_expected_view() {
        let mut bitcode = MungedBitcode::new(base());
        bitcode.add_after(0, Record::unabbreviated(9, vec![]));
        bitcode.remove(1);
        bitcode.replace(2, Record::unabbreviated(3, vec![1, 2]));
        assert_eq!(vec![0, 9, 3], codes(&bitcode));
    }

    #[test]
    fn insertions_at_distinct_indices_commute() {
        let r = Record::unabbreviated(10, vec![]);
        let r2 = Record::unabbreviated(11, vec![]);
        let mut a = MungedBitcode::new(base());
        a.add_before(0, r.clone());
        a.add_before(2, r2.clone());
        let mut b = MungedBitcode::new(base());
        b.add_before(2, r2);
        b.add_before(0, r);
        assert_eq!(codes(&a), codes(&b));
        assert_eq!(vec![10, 0, 1, 11, 2], codes(&a));
    }

    #[test]
    fn insertions_at_one_index_keep_insertion_order() {
        let mut bitcode = MungedBitcode::new(base());
        bitcode.add_before(1, Record::unabbreviated(20, vec![]));
        bitcode.add_before(1, Record::unabbreviated(21, vec![]));
        bitcode.add_after(1, Record::unabbreviated(22, vec![]));
        bitcode.add_after(1, Record::unabbreviated(23, vec![]));
        assert_eq!(vec![0, 20, 21, 1, 22, 23, 2], codes(&bitcode));
    }

    #[test]
    fn remove_and_replace_last_wins() {
        let mut bitcode = MungedBitcode::new(base());
        bitcode.replace(1, Record::unabbreviated(30, vec![]));
        bitcode.remove(1);
        assert_eq!(vec![0, 2], codes(&bitcode));

        bitcode.remove_edits();
        bitcode.remove(1);
        bitcode.replace(1, Record::unabbreviated(31, vec![]));
        assert_eq!(vec![0, 31, 2], codes(&bitcode));
    }

    #[test]
    fn removed_record_keeps_its_insertions() {
        let mut bitcode = MungedBitcode::new(base());
        bitcode.remove(1);
        bitcode.add_before(1, Record::unabbreviated(40, vec![]));
        bitcode.add_after(1, Record::unabbreviated(41, vec![]));
        assert_eq!(vec![0, 40, 41, 2], codes(&bitcode));
    }

    #[test]
    fn munge_script_applies_edits() {
        const T: u64 = u64::MAX;
        let mut bitcode = MungedBitcode::new(base());
        bitcode
            .munge(
                &[
                    0, EditAction::AddAfter as u64, 3, 9, T, //
                    1, EditAction::Remove as u64, //
                    2, EditAction::Replace as u64, 3, 3, 1, 2, T,
                ],
                T,
            )
            .unwrap();
        assert_eq!(vec![0, 9, 3], codes(&bitcode));
    }

    #[test]
    fn munge_script_rejects_bad_indices_and_actions() {
        const T: u64 = u64::MAX;
        let mut bitcode = MungedBitcode::new(base());
        assert_eq!(
            Err(Error::BadRecordIndex(7, 3)),
            bitcode.munge(&[7, 0, 3, 9, T], T)
        );
        assert_eq!(
            Err(Error::BadEditAction(1, 9)),
            bitcode.munge(&[0, 9, 3, 9, T], T)
        );
    }

    #[test]
    fn display_indents_nested_blocks() {
        let mut list = RecordList::new();
        list.push(Record::enter_block(8, 2));
        list.push(Record::unabbreviated(1, vec![4]));
        list.push(Record::exit_block());
        let bitcode = MungedBitcode::new(list);
        let text = bitcode.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "1: <65535, 8, 2>");
        assert_eq!(lines[1], "  3: <1, 4>");
        assert_eq!(lines[2], "0: <65534>");
    }
}
