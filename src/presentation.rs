//! Presentation adapters: the sink side of an apply.
//!
//! An adapter consumes edit scripts and updates whatever it renders. It
//! must not call back into the data source while presenting.
use crate::errors::PresentationError;
use crate::snapshot::Snapshot;
use crate::types::{Edit, EditScript, IndexPath, ItemId, SectionId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

pub trait PresentationAdapter: Send {
    fn present_edit_script(&mut self, script: &EditScript, animated: bool) -> Result<(), PresentationError>;
}

impl<F> PresentationAdapter for F
where
    F: FnMut(&EditScript, bool) -> Result<(), PresentationError> + Send,
{
    fn present_edit_script(&mut self, script: &EditScript, animated: bool) -> Result<(), PresentationError> {
        self(script, animated)
    }
}

/// One call received by a [`RecordingAdapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presented {
    pub script: EditScript,
    pub animated: bool,
}

/// Records every script it is handed. Clones share the same log, so a test
/// can keep one clone while the data source owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingAdapter {
    log: Arc<Mutex<Vec<Presented>>>,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self) -> Vec<Presented> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PresentationAdapter for RecordingAdapter {
    fn present_edit_script(&mut self, script: &EditScript, animated: bool) -> Result<(), PresentationError> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Presented {
                script: script.clone(),
                animated,
            });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRow {
    pub id: ItemId,
    pub children: Vec<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSection {
    pub id: SectionId,
    pub rows: Vec<MirrorRow>,
}

/// A position→identifier model kept in step by replaying edit scripts, the
/// way a list view applies batch updates. Useful as a reference adapter and
/// for checking that a script really transforms one snapshot into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListMirror {
    sections: Vec<MirrorSection>,
    reloaded_sections: Vec<SectionId>,
    reloaded_items: Vec<ItemId>,
}

/// Row under reconstruction; emptied slots are `None`.
struct WorkRow {
    id: ItemId,
    children: Vec<Option<ItemId>>,
}

impl WorkRow {
    fn fresh(id: &ItemId) -> Self {
        WorkRow { id: id.clone(), children: Vec::new() }
    }
}

struct WorkSection {
    id: SectionId,
    rows: Vec<Option<WorkRow>>,
}

impl ListMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let sections = snapshot
            .sections()
            .iter()
            .map(|section| MirrorSection {
                id: section.id().clone(),
                rows: section
                    .items()
                    .iter()
                    .map(|item| MirrorRow {
                        id: item.id().clone(),
                        children: item.children().iter().map(|c| c.id().clone()).collect(),
                    })
                    .collect(),
            })
            .collect();
        ListMirror { sections, ..ListMirror::default() }
    }

    pub fn sections(&self) -> &[MirrorSection] {
        &self.sections
    }

    /// True when the mirror shows exactly the snapshot's identifiers in the
    /// snapshot's order.
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        self.sections == ListMirror::from_snapshot(snapshot).sections
    }

    pub fn identifier_at(&self, path: IndexPath) -> Option<&ItemId> {
        let row = self.sections.get(path.section)?.rows.get(path.item)?;
        match path.child {
            Some(child) => row.children.get(child),
            None => Some(&row.id),
        }
    }

    pub fn reloaded_items(&self) -> &[ItemId] {
        &self.reloaded_items
    }

    pub fn reloaded_sections(&self) -> &[SectionId] {
        &self.reloaded_sections
    }

    /// Replays a script. On error the mirror is left unchanged.
    pub fn apply_script(&mut self, script: &EditScript) -> Result<(), PresentationError> {
        let mut sections: Vec<Option<WorkSection>> = self
            .sections
            .iter()
            .map(|section| {
                Some(WorkSection {
                    id: section.id.clone(),
                    rows: section
                        .rows
                        .iter()
                        .map(|row| {
                            Some(WorkRow {
                                id: row.id.clone(),
                                children: row.children.iter().cloned().map(Some).collect(),
                            })
                        })
                        .collect(),
                })
            })
            .collect();

        // Item removals address the old layout, so they run before any
        // section moves. Children first, while their parents are in place.
        let mut lifted: HashMap<ItemId, WorkRow> = HashMap::new();
        let removals = script.items.iter().filter_map(|edit| match edit {
            Edit::Delete { at, id } => Some((*at, id, false)),
            Edit::Move { from, id, .. } => Some((*from, id, true)),
            _ => None,
        });
        let (nested, top): (Vec<_>, Vec<_>) = removals.partition(|(at, ..)| at.is_nested());
        for (at, id, keep) in nested.into_iter().chain(top) {
            let row = lift(&mut sections, at, id)?;
            if keep {
                lifted.insert(id.clone(), row);
            }
        }

        let mut placed_sections = BTreeMap::new();
        for edit in &script.sections {
            match edit {
                Edit::Delete { at, id } => {
                    take_slot(&mut sections, *at, id)?;
                }
                Edit::Move { from, to, id } => {
                    let section = take_slot(&mut sections, *from, id)?;
                    placed_sections.insert(*to, section);
                }
                Edit::Insert { at, id } => {
                    placed_sections.insert(*at, WorkSection { id: id.clone(), rows: Vec::new() });
                }
                Edit::Reload { .. } => {}
            }
        }
        let mut sections = fill(sections, placed_sections)?;

        let mut placed_rows: BTreeMap<usize, BTreeMap<usize, WorkRow>> = BTreeMap::new();
        let mut placed_children: BTreeMap<(usize, usize), BTreeMap<usize, ItemId>> = BTreeMap::new();
        for edit in &script.items {
            let (to, row) = match edit {
                Edit::Insert { at, id } => (*at, WorkRow::fresh(id)),
                Edit::Move { to, id, .. } => {
                    let row = lifted
                        .remove(id)
                        .ok_or_else(|| PresentationError::new(format!("move of '{}' has no source", id)))?;
                    (*to, row)
                }
                _ => continue,
            };
            match to.child {
                Some(c) => {
                    if row.children.iter().any(Option::is_some) {
                        return Err(PresentationError::new(format!("'{}' cannot nest with children", row.id)));
                    }
                    placed_children.entry((to.section, to.item)).or_default().insert(c, row.id);
                }
                None => {
                    placed_rows.entry(to.section).or_default().insert(to.item, row);
                }
            }
        }

        let mut result = Vec::with_capacity(sections.len());
        for (s, section) in sections.iter_mut().enumerate() {
            let rows = std::mem::take(&mut section.rows);
            let rows = fill(rows, placed_rows.remove(&s).unwrap_or_default())?;
            let mut mirrored = Vec::with_capacity(rows.len());
            for (i, row) in rows.into_iter().enumerate() {
                let children = fill(row.children, placed_children.remove(&(s, i)).unwrap_or_default())?;
                mirrored.push(MirrorRow { id: row.id, children });
            }
            result.push(MirrorSection { id: section.id.clone(), rows: mirrored });
        }
        if !placed_rows.is_empty() || !placed_children.is_empty() {
            return Err(PresentationError::new("edit targets a row outside the new layout"));
        }

        self.sections = result;
        self.reloaded_sections
            .extend(script.sections.iter().filter_map(reload_id).cloned());
        self.reloaded_items.extend(script.items.iter().filter_map(reload_id).cloned());
        Ok(())
    }
}

impl PresentationAdapter for ListMirror {
    fn present_edit_script(&mut self, script: &EditScript, _animated: bool) -> Result<(), PresentationError> {
        self.apply_script(script)
    }
}

fn reload_id<P, K>(edit: &Edit<P, K>) -> Option<&K> {
    match edit {
        Edit::Reload { id, .. } => Some(id),
        _ => None,
    }
}

/// Removes the row or child at `at` from the old layout.
fn lift(sections: &mut [Option<WorkSection>], at: IndexPath, id: &ItemId) -> Result<WorkRow, PresentationError> {
    let missing = || PresentationError::new(format!("no '{}' at {}", id, at));
    let rows = &mut sections
        .get_mut(at.section)
        .and_then(Option::as_mut)
        .ok_or_else(missing)?
        .rows;
    match at.child {
        Some(c) => {
            let parent = rows.get_mut(at.item).and_then(Option::as_mut).ok_or_else(missing)?;
            let child = parent.children.get_mut(c).and_then(Option::take).ok_or_else(missing)?;
            if &child != id {
                return Err(missing());
            }
            Ok(WorkRow::fresh(&child))
        }
        None => {
            let row = rows.get_mut(at.item).and_then(Option::take).ok_or_else(missing)?;
            if &row.id != id {
                return Err(missing());
            }
            Ok(row)
        }
    }
}

fn take_slot(
    sections: &mut [Option<WorkSection>],
    at: usize,
    id: &SectionId,
) -> Result<WorkSection, PresentationError> {
    let section = sections
        .get_mut(at)
        .and_then(Option::take)
        .ok_or_else(|| PresentationError::new(format!("no section '{}' at {}", id, at)))?;
    if &section.id != id {
        return Err(PresentationError::new(format!("section at {} is '{}', not '{}'", at, section.id, id)));
    }
    Ok(section)
}

/// Lays out the surviving slots in order around the placed values.
fn fill<T>(slots: Vec<Option<T>>, mut placed: BTreeMap<usize, T>) -> Result<Vec<T>, PresentationError> {
    let mut kept = slots.into_iter().flatten();
    let mut out = Vec::new();
    loop {
        let n = out.len();
        if let Some(value) = placed.remove(&n) {
            out.push(value);
        } else if let Some(value) = kept.next() {
            out.push(value);
        } else {
            break;
        }
    }
    if !placed.is_empty() {
        return Err(PresentationError::new(format!(
            "placement past the end of a list of {}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff_engine::diff;
    use crate::snapshot::{Item, Section};
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn leaf(id: &str) -> Item {
        Item::leaf(id, Value::Null)
    }

    #[test]
    fn fill_interleaves_kept_and_placed() {
        let mut placed = BTreeMap::new();
        placed.insert(0, 'x');
        placed.insert(3, 'y');
        let out = fill(vec![Some('a'), None, Some('b')], placed).unwrap();
        assert_eq!(out, vec!['x', 'a', 'b', 'y']);
    }

    #[test]
    fn fill_rejects_gaps() {
        let mut placed = BTreeMap::new();
        placed.insert(5, 'x');
        assert!(fill(vec![Some('a')], placed).is_err());
    }

    #[test]
    fn mirror_follows_section_and_item_edits() {
        let old = Snapshot::from_sections(vec![
            Section::new("Illinois").with_items(vec![
                Item::header_with_children("hdr", Value::Null, vec![leaf("Chicago"), leaf("Springfield")]),
                leaf("Peoria"),
            ]),
            Section::new("Missouri").with_items(vec![leaf("Columbia")]),
        ])
        .unwrap();
        let new = Snapshot::from_sections(vec![
            Section::new("Iowa").with_items(vec![leaf("Springfield"), leaf("Ames")]),
            Section::new("Illinois").with_items(vec![
                leaf("Peoria"),
                Item::header_with_children("hdr", Value::Null, vec![leaf("Chicago"), leaf("Columbia")]),
            ]),
        ])
        .unwrap();

        let mut mirror = ListMirror::from_snapshot(&old);
        mirror.apply_script(&diff(&old, &new).unwrap()).unwrap();
        assert!(mirror.matches(&new));
        assert_eq!(mirror.identifier_at(IndexPath::nested(1, 1, 1)), Some(&ItemId::from("Columbia")));
    }

    #[test]
    fn inconsistent_script_leaves_mirror_unchanged() {
        let old = Snapshot::from_sections(vec![Section::new("Illinois").with_items(vec![leaf("Chicago")])]).unwrap();
        let mut mirror = ListMirror::from_snapshot(&old);
        let bogus = EditScript {
            sections: Vec::new(),
            items: vec![Edit::Delete { at: IndexPath::new(0, 3), id: ItemId::from("Chicago") }],
        };
        assert!(mirror.apply_script(&bogus).is_err());
        assert!(mirror.matches(&old));
    }

    #[test]
    fn recording_adapter_shares_log_between_clones() {
        let recorder = RecordingAdapter::new();
        let mut owned = recorder.clone();
        owned.present_edit_script(&EditScript::default(), true).unwrap();
        assert_eq!(
            recorder.presented(),
            vec![Presented { script: EditScript::default(), animated: true }]
        );
    }

    #[test]
    fn closures_are_adapters() {
        let mut calls = 0;
        {
            let mut adapter = |_: &EditScript, animated: bool| {
                assert!(!animated);
                calls += 1;
                Ok::<(), PresentationError>(())
            };
            adapter.present_edit_script(&EditScript::default(), false).unwrap();
        }
        assert_eq!(calls, 1);
    }
}
