//! Identity, equality and edit-script types shared by every layer
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::Hash;

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                $name(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                $name(id)
            }
        }

        impl From<&$name> for $name {
            fn from(id: &$name) -> Self {
                id.clone()
            }
        }
    };
}

identifier!(
    /// Caller-chosen stable key of a section. Lives in its own namespace,
    /// so a section and an item may share the same string.
    SectionId
);

identifier!(
    /// Caller-chosen stable key of an item, unique across all sections and
    /// nesting levels of a snapshot.
    ItemId
);

/// Comparable digest of an entity's visible fields. Never includes the
/// identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub u64);

impl ContentHash {
    /// First 8 bytes (big-endian) of SHA-256 over the kind tag, a NUL
    /// separator and the compact JSON rendering of the content. Object keys
    /// serialize sorted, so equal values hash equally on every run and
    /// toolchain.
    pub fn of(tag: &str, content: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tag.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        ContentHash(u64::from_be_bytes(prefix))
    }
}

/// Anything the diff engine can match across snapshots.
pub trait Identifiable {
    type Id: Eq + Hash + Clone + fmt::Debug;

    fn identifier(&self) -> &Self::Id;

    fn content_hash(&self) -> ContentHash;
}

pub fn same_identity<T: Identifiable>(a: &T, b: &T) -> bool {
    a.identifier() == b.identifier()
}

pub fn same_content<T: Identifiable>(a: &T, b: &T) -> bool {
    a.content_hash() == b.content_hash()
}

/// Position of an item: section index, row within the section, and the
/// child row when the item is nested under a header. A parent sorts before
/// its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexPath {
    pub section: usize,
    pub item: usize,
    pub child: Option<usize>,
}

impl IndexPath {
    pub fn new(section: usize, item: usize) -> Self {
        IndexPath { section, item, child: None }
    }

    pub fn nested(section: usize, item: usize, child: usize) -> Self {
        IndexPath { section, item, child: Some(child) }
    }

    pub fn parent(&self) -> Option<IndexPath> {
        self.child.map(|_| IndexPath::new(self.section, self.item))
    }

    pub fn is_nested(&self) -> bool {
        self.child.is_some()
    }
}

impl fmt::Display for IndexPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.child {
            Some(child) => write!(f, "[{}, {}, {}]", self.section, self.item, child),
            None => write!(f, "[{}, {}]", self.section, self.item),
        }
    }
}

/// Edit action enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    Delete,
    Insert,
    Move,
    Reload,
}

impl fmt::Display for EditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EditAction::Delete => "DELETE",
            EditAction::Insert => "INSERT",
            EditAction::Move => "MOVE",
            EditAction::Reload => "RELOAD",
        };
        f.write_str(name)
    }
}

/// One structural edit. Deletes and move sources refer to positions in the
/// old snapshot; inserts, move destinations and reloads to the new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Edit<P, K> {
    Delete { at: P, id: K },
    Insert { at: P, id: K },
    Move { from: P, to: P, id: K },
    Reload { at: P, id: K },
}

impl<P, K> Edit<P, K> {
    pub fn action(&self) -> EditAction {
        match self {
            Edit::Delete { .. } => EditAction::Delete,
            Edit::Insert { .. } => EditAction::Insert,
            Edit::Move { .. } => EditAction::Move,
            Edit::Reload { .. } => EditAction::Reload,
        }
    }

    pub fn id(&self) -> &K {
        match self {
            Edit::Delete { id, .. }
            | Edit::Insert { id, .. }
            | Edit::Move { id, .. }
            | Edit::Reload { id, .. } => id,
        }
    }
}

pub type SectionEdit = Edit<usize, SectionId>;
pub type ItemEdit = Edit<IndexPath, ItemId>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditCounts {
    pub deletes: usize,
    pub inserts: usize,
    pub moves: usize,
    pub reloads: usize,
}

impl EditCounts {
    fn tally<P, K>(mut self, edit: &Edit<P, K>) -> Self {
        match edit.action() {
            EditAction::Delete => self.deletes += 1,
            EditAction::Insert => self.inserts += 1,
            EditAction::Move => self.moves += 1,
            EditAction::Reload => self.reloads += 1,
        }
        self
    }
}

/// Section edits are committed as a whole before item edits, which are
/// expressed against the resulting section set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EditScript {
    pub sections: Vec<SectionEdit>,
    pub items: Vec<ItemEdit>,
}

impl EditScript {
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty() && self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sections.len() + self.items.len()
    }

    pub fn section_counts(&self) -> EditCounts {
        self.sections.iter().fold(EditCounts::default(), EditCounts::tally)
    }

    pub fn item_counts(&self) -> EditCounts {
        self.items.iter().fold(EditCounts::default(), EditCounts::tally)
    }
}
