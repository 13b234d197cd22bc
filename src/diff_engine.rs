//! Core diffing engine: identity-keyed, LIS-minimized edit scripts
//!
//! Sections are resolved first. Items and header children are then diffed
//! container by container against the resulting section set, so a section
//! delete or insert never produces item-level edits for the rows it
//! carries.
use crate::errors::{SnapshotError, SnapshotSide};
use crate::snapshot::{Item, Snapshot, SnapshotIndex};
use crate::types::{Edit, EditScript, Identifiable, IndexPath, ItemEdit, ItemId, SectionEdit};
use lis::longest_increasing_subsequence;
use log::{debug, trace};
use std::collections::HashMap;

/// Validates both snapshots, then diffs them.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Result<EditScript, SnapshotError> {
    let old_index = old.validate().map_err(|e| SnapshotError::invalid(SnapshotSide::Old, e))?;
    let new_index = new.validate().map_err(|e| SnapshotError::invalid(SnapshotSide::New, e))?;
    Ok(DiffEngine::new(old, &old_index, new, &new_index).reconcile())
}

/// A row of one container: its position and identifier.
type Entry<'s> = (IndexPath, &'s ItemId);

pub struct DiffEngine<'a> {
    old: &'a Snapshot,
    old_index: &'a SnapshotIndex,
    new: &'a Snapshot,
    new_index: &'a SnapshotIndex,
    deletes: Vec<ItemEdit>,
    inserts: Vec<ItemEdit>,
    moves: Vec<ItemEdit>,
}

impl<'a> DiffEngine<'a> {
    /// Both indexes must come from validating the matching snapshot.
    pub fn new(
        old: &'a Snapshot,
        old_index: &'a SnapshotIndex,
        new: &'a Snapshot,
        new_index: &'a SnapshotIndex,
    ) -> Self {
        DiffEngine {
            old,
            old_index,
            new,
            new_index,
            deletes: Vec::new(),
            inserts: Vec::new(),
            moves: Vec::new(),
        }
    }

    pub fn reconcile(mut self) -> EditScript {
        let sections = self.diff_sections();
        let items = self.diff_items();
        let script = EditScript { sections, items };
        debug!(
            "DiffEngine: {} -> {} sections, {} -> {} items, sections {:?}, items {:?}",
            self.old.number_of_sections(),
            self.new.number_of_sections(),
            self.old_index.number_of_items(),
            self.new_index.number_of_items(),
            script.section_counts(),
            script.item_counts(),
        );
        script
    }

    fn diff_sections(&self) -> Vec<SectionEdit> {
        let mut edits = Vec::new();

        for (i, section) in self.old.sections().iter().enumerate().rev() {
            if !self.new_index.contains_section(section.id()) {
                edits.push(Edit::Delete { at: i, id: section.id().clone() });
            }
        }

        let mut survivors = Vec::new();
        for (n, section) in self.new.sections().iter().enumerate() {
            match self.old_index.section_index(section.id()) {
                Some(o) => survivors.push((n, o)),
                None => edits.push(Edit::Insert { at: n, id: section.id().clone() }),
            }
        }

        let olds: Vec<usize> = survivors.iter().map(|&(_, o)| o).collect();
        let in_place = keep_in_place(&olds);
        for (&(n, o), keep) in survivors.iter().zip(&in_place) {
            if !keep {
                edits.push(Edit::Move { from: o, to: n, id: self.new.sections()[n].id().clone() });
            }
        }

        for &(n, o) in &survivors {
            let (before, after) = (&self.old.sections()[o], &self.new.sections()[n]);
            if before.content_hash() != after.content_hash() || self.new.reloaded_sections().contains(after.id()) {
                edits.push(Edit::Reload { at: n, id: after.id().clone() });
            }
        }

        trace!("DiffEngine::diff_sections: {} edits", edits.len());
        edits
    }

    fn diff_items(&mut self) -> Vec<ItemEdit> {
        let (new, old) = (self.new, self.old);
        for (path, item) in old.rows() {
            if self.available(item.id()).is_some() && !self.new_index.contains_item(item.id()) {
                self.deletes.push(Edit::Delete { at: path, id: item.id().clone() });
            }
        }
        self.deletes.reverse();

        for (s, section) in new.sections().iter().enumerate() {
            let old_rows: Vec<Entry<'a>> = match self.old_index.section_index(section.id()) {
                Some(o) => entries(old.sections()[o].items(), |i| IndexPath::new(o, i)),
                None => Vec::new(),
            };
            let new_rows = entries(section.items(), |i| IndexPath::new(s, i));
            self.diff_container(&old_rows, &new_rows);

            for (i, row) in section.items().iter().enumerate() {
                if !row.is_header() {
                    continue;
                }
                let old_children = self.old_children(row.id());
                let new_children = entries(row.children(), |c| IndexPath::nested(s, i, c));
                self.diff_container(&old_children, &new_children);
            }
        }

        self.inserts.sort_by_key(target);
        self.moves.sort_by_key(target);

        let mut edits = std::mem::take(&mut self.deletes);
        edits.append(&mut self.inserts);
        edits.append(&mut self.moves);
        edits.extend(self.reloads());
        edits
    }

    /// Rows that existed in `old` and stayed in the same container keep
    /// their slot when they belong to the longest increasing run of old
    /// positions; every other survivor moves. Rows new to the container
    /// move in when they are available elsewhere, else they are inserted.
    fn diff_container(&mut self, old_rows: &[Entry<'a>], new_rows: &[Entry<'a>]) {
        let old_slots: HashMap<&ItemId, (usize, IndexPath)> = old_rows
            .iter()
            .enumerate()
            .map(|(k, &(path, id))| (id, (k, path)))
            .collect();

        let mut stayed = Vec::new();
        for &(to, id) in new_rows {
            if let Some(&(k, from)) = old_slots.get(id) {
                stayed.push((k, from, to, id));
            } else if let Some(from) = self.available(id) {
                self.moves.push(Edit::Move { from, to, id: id.clone() });
            } else {
                self.inserts.push(Edit::Insert { at: to, id: id.clone() });
            }
        }

        let olds: Vec<usize> = stayed.iter().map(|&(k, ..)| k).collect();
        let in_place = keep_in_place(&olds);
        for (&(_, from, to, id), keep) in stayed.iter().zip(&in_place) {
            if !keep {
                self.moves.push(Edit::Move { from, to, id: id.clone() });
            }
        }
        trace!(
            "DiffEngine::diff_container: old_len={} new_len={} in_place={}",
            old_rows.len(),
            new_rows.len(),
            in_place.iter().filter(|k| **k).count()
        );
    }

    /// Children the header owned in `old`, when it was a header there and
    /// is not being inserted fresh.
    fn old_children(&self, id: &ItemId) -> Vec<Entry<'a>> {
        let old = self.old;
        match self.available(id) {
            Some(path) if !path.is_nested() => match old.item_at(path) {
                Some(row) if row.is_header() => {
                    entries(row.children(), |c| IndexPath::nested(path.section, path.item, c))
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Old position of an item whose ancestors all survive into `new`, so
    /// it can be moved or kept rather than inserted. Rows of a deleted
    /// section, and children of a deleted row, vanish with their container.
    fn available(&self, id: &ItemId) -> Option<IndexPath> {
        let path = self.old_index.position_of(id)?;
        let section = self.old.sections().get(path.section)?;
        if !self.new_index.contains_section(section.id()) {
            return None;
        }
        if let Some(parent) = path.parent() {
            let parent = self.old.item_at(parent)?;
            if !self.new_index.contains_item(parent.id()) {
                return None;
            }
        }
        Some(path)
    }

    fn reloads(&self) -> Vec<ItemEdit> {
        self.new
            .rows()
            .filter(|(_, item)| {
                self.available(item.id())
                    .and_then(|from| self.old.item_at(from))
                    .is_some_and(|before| {
                        before.content_hash() != item.content_hash()
                            || self.new.reloaded_items().contains(item.id())
                    })
            })
            .map(|(at, item)| Edit::Reload { at, id: item.id().clone() })
            .collect()
    }
}

fn entries<'s>(items: &'s [Item], path: impl Fn(usize) -> IndexPath) -> Vec<Entry<'s>> {
    items.iter().enumerate().map(|(i, item)| (path(i), item.id())).collect()
}

fn target(edit: &ItemEdit) -> IndexPath {
    match edit {
        Edit::Move { to, .. } => *to,
        Edit::Delete { at, .. } | Edit::Insert { at, .. } | Edit::Reload { at, .. } => *at,
    }
}

/// Marks the entries of `olds` that form a longest increasing subsequence.
/// Empty input yields an empty mask.
fn keep_in_place(olds: &[usize]) -> Vec<bool> {
    let mut mask = vec![false; olds.len()];
    if olds.is_empty() {
        return mask;
    }
    for i in longest_increasing_subsequence(olds) {
        mask[i] = true;
    }
    mask
}
