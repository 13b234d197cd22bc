//! Immutable snapshots of a sectioned, outlined list and the builder that
//! produces them.
//!
//! A [`Snapshot`] is plain ordered data. The builder validates every
//! mutation eagerly, so anything it yields is well formed. Snapshots that
//! arrive through serde are unchecked until [`Snapshot::validate`] runs,
//! which the diff engine and the data source both do before touching them.
use crate::errors::SnapshotError;
use crate::types::{ContentHash, Identifiable, IndexPath, ItemId, SectionId};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Header,
    Leaf,
}

/// A row. Headers may own one level of leaf children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Item {
    Header {
        id: ItemId,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        children: Vec<Item>,
    },
    Leaf {
        id: ItemId,
        #[serde(default)]
        content: Value,
    },
}

impl Item {
    pub fn leaf(id: impl Into<ItemId>, content: Value) -> Self {
        Item::Leaf {
            id: id.into(),
            content,
        }
    }

    pub fn header(id: impl Into<ItemId>, content: Value) -> Self {
        Item::Header {
            id: id.into(),
            content,
            children: Vec::new(),
        }
    }

    pub fn header_with_children(id: impl Into<ItemId>, content: Value, children: Vec<Item>) -> Self {
        Item::Header {
            id: id.into(),
            content,
            children,
        }
    }

    pub fn id(&self) -> &ItemId {
        match self {
            Item::Header { id, .. } | Item::Leaf { id, .. } => id,
        }
    }

    pub fn content(&self) -> &Value {
        match self {
            Item::Header { content, .. } | Item::Leaf { content, .. } => content,
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            Item::Header { .. } => ItemKind::Header,
            Item::Leaf { .. } => ItemKind::Leaf,
        }
    }

    pub fn is_header(&self) -> bool {
        self.kind() == ItemKind::Header
    }

    pub fn children(&self) -> &[Item] {
        match self {
            Item::Header { children, .. } => children,
            Item::Leaf { .. } => &[],
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<Item>> {
        match self {
            Item::Header { children, .. } => Some(children),
            Item::Leaf { .. } => None,
        }
    }
}

impl Identifiable for Item {
    type Id = ItemId;

    fn identifier(&self) -> &ItemId {
        self.id()
    }

    fn content_hash(&self) -> ContentHash {
        let tag = match self.kind() {
            ItemKind::Header => "header",
            ItemKind::Leaf => "leaf",
        };
        ContentHash::of(tag, self.content())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    id: SectionId,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    items: Vec<Item>,
}

impl Section {
    pub fn new(id: impl Into<SectionId>) -> Self {
        Section {
            id: id.into(),
            content: Value::Null,
            items: Vec::new(),
        }
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    pub fn with_items(mut self, items: Vec<Item>) -> Self {
        self.items = items;
        self
    }

    pub fn id(&self) -> &SectionId {
        &self.id
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }
}

impl Identifiable for Section {
    type Id = SectionId;

    fn identifier(&self) -> &SectionId {
        &self.id
    }

    fn content_hash(&self) -> ContentHash {
        ContentHash::of("section", &self.content)
    }
}

/// Identifier lookups over a validated snapshot. Both maps iterate in
/// snapshot order.
#[derive(Debug, Clone, Default)]
pub struct SnapshotIndex {
    sections: IndexMap<SectionId, usize>,
    items: IndexMap<ItemId, IndexPath>,
}

impl SnapshotIndex {
    /// Checks every structural invariant while indexing. Fails on the first
    /// violation found in snapshot order.
    pub fn build(snapshot: &Snapshot) -> Result<Self, SnapshotError> {
        let mut index = SnapshotIndex::default();
        for (s, section) in snapshot.sections.iter().enumerate() {
            if index.sections.insert(section.id.clone(), s).is_some() {
                return Err(SnapshotError::duplicate(&section.id));
            }
            for (i, item) in section.items.iter().enumerate() {
                index.insert_item(item.id(), IndexPath::new(s, i))?;
                for (c, child) in item.children().iter().enumerate() {
                    check_child(item.id(), child)?;
                    index.insert_item(child.id(), IndexPath::nested(s, i, c))?;
                }
            }
        }
        Ok(index)
    }

    fn insert_item(&mut self, id: &ItemId, path: IndexPath) -> Result<(), SnapshotError> {
        if self.items.insert(id.clone(), path).is_some() {
            return Err(SnapshotError::duplicate(id));
        }
        Ok(())
    }

    pub fn section_index(&self, id: &SectionId) -> Option<usize> {
        self.sections.get(id).copied()
    }

    pub fn section_at(&self, index: usize) -> Option<&SectionId> {
        self.sections.get_index(index).map(|(id, _)| id)
    }

    pub fn position_of(&self, id: &ItemId) -> Option<IndexPath> {
        self.items.get(id).copied()
    }

    pub fn contains_item(&self, id: &ItemId) -> bool {
        self.items.contains_key(id)
    }

    pub fn contains_section(&self, id: &SectionId) -> bool {
        self.sections.contains_key(id)
    }

    pub fn number_of_sections(&self) -> usize {
        self.sections.len()
    }

    pub fn number_of_items(&self) -> usize {
        self.items.len()
    }
}

fn check_child(parent: &ItemId, child: &Item) -> Result<(), SnapshotError> {
    if child.is_header() {
        return Err(SnapshotError::nesting(
            child.id(),
            format!("header cannot be nested under '{}'", parent),
        ));
    }
    Ok(())
}

/// Ordered sections and items, plus identifiers whose rows must reload even
/// when their content is unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    sections: Vec<Section>,
    #[serde(default, skip_serializing_if = "IndexSet::is_empty")]
    reloaded_sections: IndexSet<SectionId>,
    #[serde(default, skip_serializing_if = "IndexSet::is_empty")]
    reloaded_items: IndexSet<ItemId>,
}

impl Snapshot {
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    /// Builds a snapshot from fully formed sections, failing on the first
    /// invariant violation.
    pub fn from_sections(sections: Vec<Section>) -> Result<Self, SnapshotError> {
        let snapshot = Snapshot {
            sections,
            ..Snapshot::default()
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Starts a builder from a copy of this snapshot. Forced reloads are not
    /// carried over; they only apply to the diff that introduced them.
    pub fn to_builder(&self) -> Result<SnapshotBuilder, SnapshotError> {
        let snapshot = Snapshot {
            sections: self.sections.clone(),
            ..Snapshot::default()
        };
        let index = SnapshotIndex::build(&snapshot)?;
        Ok(SnapshotBuilder { snapshot, index })
    }

    pub fn validate(&self) -> Result<SnapshotIndex, SnapshotError> {
        SnapshotIndex::build(self)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, id: &SectionId) -> Option<&Section> {
        self.sections.iter().find(|s| &s.id == id)
    }

    pub fn section_identifiers(&self) -> Vec<SectionId> {
        self.sections.iter().map(|s| s.id.clone()).collect()
    }

    /// All item identifiers in total order: sections, rows, then children.
    pub fn item_identifiers(&self) -> Vec<ItemId> {
        self.rows().map(|(_, item)| item.id().clone()).collect()
    }

    pub fn item_identifiers_in_section(&self, id: &SectionId) -> Option<Vec<ItemId>> {
        self.section(id)
            .map(|s| s.items.iter().map(|item| item.id().clone()).collect())
    }

    pub fn number_of_sections(&self) -> usize {
        self.sections.len()
    }

    /// Counts every item, nested children included.
    pub fn number_of_items(&self) -> usize {
        self.rows().count()
    }

    pub fn number_of_items_in_section(&self, id: &SectionId) -> Option<usize> {
        self.section(id).map(|s| s.items.len())
    }

    pub fn index_of_section(&self, id: &SectionId) -> Option<usize> {
        self.sections.iter().position(|s| &s.id == id)
    }

    pub fn section_identifier_for_item(&self, id: &ItemId) -> Option<&SectionId> {
        self.rows()
            .find(|(_, item)| item.id() == id)
            .and_then(|(path, _)| self.sections.get(path.section))
            .map(|s| &s.id)
    }

    pub fn item(&self, id: &ItemId) -> Option<&Item> {
        self.rows().find(|(_, item)| item.id() == id).map(|(_, item)| item)
    }

    pub fn item_at(&self, path: IndexPath) -> Option<&Item> {
        let row = self.sections.get(path.section)?.items.get(path.item)?;
        match path.child {
            Some(child) => row.children().get(child),
            None => Some(row),
        }
    }

    pub fn reloaded_sections(&self) -> &IndexSet<SectionId> {
        &self.reloaded_sections
    }

    pub fn reloaded_items(&self) -> &IndexSet<ItemId> {
        &self.reloaded_items
    }

    /// Every item with its position, in total order.
    pub fn rows(&self) -> impl Iterator<Item = (IndexPath, &Item)> + '_ {
        self.sections.iter().enumerate().flat_map(|(s, section)| {
            section.items.iter().enumerate().flat_map(move |(i, item)| {
                std::iter::once((IndexPath::new(s, i), item)).chain(
                    item.children()
                        .iter()
                        .enumerate()
                        .map(move |(c, child)| (IndexPath::nested(s, i, c), child)),
                )
            })
        })
    }
}

/// Mutable staging area for a new [`Snapshot`]. Every operation validates
/// before it mutates, so a failed call leaves the builder unchanged.
#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder {
    snapshot: Snapshot,
    index: SnapshotIndex,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> Snapshot {
        self.snapshot
    }

    /// Read access to what has been staged so far.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn append_section(&mut self, id: impl Into<SectionId>) -> Result<&mut Self, SnapshotError> {
        self.append_section_with_content(id, Value::Null)
    }

    pub fn append_section_with_content(
        &mut self,
        id: impl Into<SectionId>,
        content: Value,
    ) -> Result<&mut Self, SnapshotError> {
        let id = id.into();
        if self.index.contains_section(&id) {
            return Err(SnapshotError::duplicate(&id));
        }
        self.index.sections.insert(id.clone(), self.snapshot.sections.len());
        self.snapshot.sections.push(Section::new(id).with_content(content));
        Ok(self)
    }

    pub fn append_sections<I, S>(&mut self, ids: I) -> Result<&mut Self, SnapshotError>
    where
        I: IntoIterator<Item = S>,
        S: Into<SectionId>,
    {
        let ids: Vec<SectionId> = ids.into_iter().map(Into::into).collect();
        let mut seen = HashSet::new();
        for id in &ids {
            if self.index.contains_section(id) || !seen.insert(id) {
                return Err(SnapshotError::duplicate(id));
            }
        }
        for id in ids {
            self.append_section(id)?;
        }
        Ok(self)
    }

    pub fn append_items(
        &mut self,
        items: impl IntoIterator<Item = Item>,
        to_section: impl Into<SectionId>,
    ) -> Result<&mut Self, SnapshotError> {
        let section_id = to_section.into();
        let s = self
            .index
            .section_index(&section_id)
            .ok_or(SnapshotError::UnknownSection(section_id))?;
        let items: Vec<Item> = items.into_iter().collect();
        self.check_new_rows(&items)?;

        let rows = &mut self.snapshot.sections[s].items;
        for item in items {
            let i = rows.len();
            self.index.items.insert(item.id().clone(), IndexPath::new(s, i));
            for (c, child) in item.children().iter().enumerate() {
                self.index.items.insert(child.id().clone(), IndexPath::nested(s, i, c));
            }
            rows.push(item);
        }
        Ok(self)
    }

    pub fn append_children(
        &mut self,
        items: impl IntoIterator<Item = Item>,
        to_parent: impl Into<ItemId>,
    ) -> Result<&mut Self, SnapshotError> {
        let parent_id = to_parent.into();
        let path = self.parent_path(&parent_id)?;
        let items: Vec<Item> = items.into_iter().collect();
        self.check_new_children(&parent_id, &items)?;

        let parent = &mut self.snapshot.sections[path.section].items[path.item];
        let children = parent
            .children_mut()
            .ok_or_else(|| SnapshotError::nesting(&parent_id, "leaf items cannot own children"))?;
        for item in items {
            let c = children.len();
            self.index
                .items
                .insert(item.id().clone(), IndexPath::nested(path.section, path.item, c));
            children.push(item);
        }
        Ok(self)
    }

    pub fn insert_items_before(
        &mut self,
        items: impl IntoIterator<Item = Item>,
        before: impl Into<ItemId>,
    ) -> Result<&mut Self, SnapshotError> {
        self.insert_items(items.into_iter().collect(), before.into(), 0)
    }

    pub fn insert_items_after(
        &mut self,
        items: impl IntoIterator<Item = Item>,
        after: impl Into<ItemId>,
    ) -> Result<&mut Self, SnapshotError> {
        self.insert_items(items.into_iter().collect(), after.into(), 1)
    }

    fn insert_items(&mut self, items: Vec<Item>, anchor: ItemId, offset: usize) -> Result<&mut Self, SnapshotError> {
        let path = self
            .index
            .position_of(&anchor)
            .ok_or_else(|| SnapshotError::UnknownItem(anchor.clone()))?;
        match path.child {
            Some(c) => {
                let parent_id = self.snapshot.sections[path.section].items[path.item].id().clone();
                self.check_new_children(&parent_id, &items)?;
                let parent = &mut self.snapshot.sections[path.section].items[path.item];
                if let Some(children) = parent.children_mut() {
                    let tail = children.split_off(c + offset);
                    children.extend(items);
                    children.extend(tail);
                }
            }
            None => {
                self.check_new_rows(&items)?;
                let rows = &mut self.snapshot.sections[path.section].items;
                let tail = rows.split_off(path.item + offset);
                rows.extend(items);
                rows.extend(tail);
            }
        }
        self.reindex()
    }

    /// Deleting a header removes its children with it.
    pub fn delete_items<I, S>(&mut self, ids: I) -> Result<&mut Self, SnapshotError>
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        let ids: HashSet<ItemId> = ids.into_iter().map(Into::into).collect();
        if let Some(missing) = ids.iter().find(|id| !self.index.contains_item(id)) {
            return Err(SnapshotError::UnknownItem(missing.clone()));
        }
        for section in &mut self.snapshot.sections {
            section.items.retain(|item| !ids.contains(item.id()));
            for item in &mut section.items {
                if let Some(children) = item.children_mut() {
                    children.retain(|child| !ids.contains(child.id()));
                }
            }
        }
        self.reindex()
    }

    pub fn delete_sections<I, S>(&mut self, ids: I) -> Result<&mut Self, SnapshotError>
    where
        I: IntoIterator<Item = S>,
        S: Into<SectionId>,
    {
        let ids: HashSet<SectionId> = ids.into_iter().map(Into::into).collect();
        if let Some(missing) = ids.iter().find(|id| !self.index.contains_section(id)) {
            return Err(SnapshotError::UnknownSection(missing.clone()));
        }
        self.snapshot.sections.retain(|s| !ids.contains(&s.id));
        self.reindex()
    }

    pub fn delete_all_items(&mut self) -> Result<&mut Self, SnapshotError> {
        for section in &mut self.snapshot.sections {
            section.items.clear();
        }
        self.reindex()
    }

    /// `new_order` must name every current section exactly once.
    pub fn reorder_sections<I, S>(&mut self, new_order: I) -> Result<&mut Self, SnapshotError>
    where
        I: IntoIterator<Item = S>,
        S: Into<SectionId>,
    {
        let order: Vec<SectionId> = new_order.into_iter().map(Into::into).collect();
        let current: Vec<SectionId> = self.snapshot.section_identifiers();
        let permutation = permutation(&current, &order)?;
        let sections = std::mem::take(&mut self.snapshot.sections);
        self.snapshot.sections = apply_permutation(sections, &permutation);
        self.reindex()
    }

    /// `new_order` must name every top-level item of the section exactly once.
    pub fn reorder_items<I, S>(
        &mut self,
        new_order: I,
        within_section: impl Into<SectionId>,
    ) -> Result<&mut Self, SnapshotError>
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        let section_id = within_section.into();
        let s = self
            .index
            .section_index(&section_id)
            .ok_or(SnapshotError::UnknownSection(section_id))?;
        let order: Vec<ItemId> = new_order.into_iter().map(Into::into).collect();
        let current: Vec<ItemId> = self.snapshot.sections[s].items.iter().map(|i| i.id().clone()).collect();
        let permutation = permutation(&current, &order)?;
        let items = std::mem::take(&mut self.snapshot.sections[s].items);
        self.snapshot.sections[s].items = apply_permutation(items, &permutation);
        self.reindex()
    }

    /// `new_order` must name every child of the header exactly once.
    pub fn reorder_children<I, S>(
        &mut self,
        new_order: I,
        within_parent: impl Into<ItemId>,
    ) -> Result<&mut Self, SnapshotError>
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        let parent_id = within_parent.into();
        let path = self.parent_path(&parent_id)?;
        let order: Vec<ItemId> = new_order.into_iter().map(Into::into).collect();
        let parent = &mut self.snapshot.sections[path.section].items[path.item];
        let current: Vec<ItemId> = parent.children().iter().map(|c| c.id().clone()).collect();
        let permutation = permutation(&current, &order)?;
        if let Some(children) = parent.children_mut() {
            let taken = std::mem::take(children);
            *children = apply_permutation(taken, &permutation);
        }
        self.reindex()
    }

    pub fn reload_items<I, S>(&mut self, ids: I) -> Result<&mut Self, SnapshotError>
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        let ids: Vec<ItemId> = ids.into_iter().map(Into::into).collect();
        if let Some(missing) = ids.iter().find(|id| !self.index.contains_item(id)) {
            return Err(SnapshotError::UnknownItem(missing.clone()));
        }
        self.snapshot.reloaded_items.extend(ids);
        Ok(self)
    }

    pub fn reload_sections<I, S>(&mut self, ids: I) -> Result<&mut Self, SnapshotError>
    where
        I: IntoIterator<Item = S>,
        S: Into<SectionId>,
    {
        let ids: Vec<SectionId> = ids.into_iter().map(Into::into).collect();
        if let Some(missing) = ids.iter().find(|id| !self.index.contains_section(id)) {
            return Err(SnapshotError::UnknownSection(missing.clone()));
        }
        self.snapshot.reloaded_sections.extend(ids);
        Ok(self)
    }

    /// Resolves a header that may receive children.
    fn parent_path(&self, parent_id: &ItemId) -> Result<IndexPath, SnapshotError> {
        let path = self
            .index
            .position_of(parent_id)
            .ok_or_else(|| SnapshotError::UnknownParent(parent_id.clone()))?;
        if path.is_nested() {
            return Err(SnapshotError::nesting(parent_id, "parent is itself nested"));
        }
        if !self.snapshot.sections[path.section].items[path.item].is_header() {
            return Err(SnapshotError::nesting(parent_id, "leaf items cannot own children"));
        }
        Ok(path)
    }

    fn check_new_rows(&self, items: &[Item]) -> Result<(), SnapshotError> {
        let mut seen = HashSet::new();
        for item in items {
            self.check_fresh(item.id(), &mut seen)?;
            for child in item.children() {
                check_child(item.id(), child)?;
                self.check_fresh(child.id(), &mut seen)?;
            }
        }
        Ok(())
    }

    fn check_new_children(&self, parent: &ItemId, items: &[Item]) -> Result<(), SnapshotError> {
        let mut seen = HashSet::new();
        for item in items {
            check_child(parent, item)?;
            self.check_fresh(item.id(), &mut seen)?;
        }
        Ok(())
    }

    fn check_fresh<'a>(&self, id: &'a ItemId, seen: &mut HashSet<&'a ItemId>) -> Result<(), SnapshotError> {
        if self.index.contains_item(id) || !seen.insert(id) {
            return Err(SnapshotError::duplicate(id));
        }
        Ok(())
    }

    fn reindex(&mut self) -> Result<&mut Self, SnapshotError> {
        self.index = SnapshotIndex::build(&self.snapshot)?;
        let index = &self.index;
        self.snapshot.reloaded_items.retain(|id| index.contains_item(id));
        self.snapshot.reloaded_sections.retain(|id| index.contains_section(id));
        Ok(self)
    }
}

/// Maps each slot of `order` to its index in `current`, requiring a true
/// permutation.
fn permutation<K>(current: &[K], order: &[K]) -> Result<Vec<usize>, SnapshotError>
where
    K: std::hash::Hash + Eq + std::fmt::Display,
{
    if current.len() != order.len() {
        return Err(SnapshotError::InvalidReorder {
            details: format!("expected {} identifiers, got {}", current.len(), order.len()),
        });
    }
    let positions: IndexMap<&K, usize> = current.iter().enumerate().map(|(i, k)| (k, i)).collect();
    let mut used = vec![false; current.len()];
    let mut result = Vec::with_capacity(order.len());
    for id in order {
        let i = *positions.get(id).ok_or_else(|| SnapshotError::InvalidReorder {
            details: format!("'{}' is not present", id),
        })?;
        if std::mem::replace(&mut used[i], true) {
            return Err(SnapshotError::InvalidReorder {
                details: format!("'{}' listed twice", id),
            });
        }
        result.push(i);
    }
    Ok(result)
}

fn apply_permutation<T>(values: Vec<T>, permutation: &[usize]) -> Vec<T> {
    let mut slots: Vec<Option<T>> = values.into_iter().map(Some).collect();
    permutation.iter().filter_map(|&i| slots[i].take()).collect()
}
