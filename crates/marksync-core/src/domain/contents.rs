//! Store snapshots and deltas
//!
//! [`Contents`] is the snapshot of one store. Entries are keyed by
//! `(file_name, is_removed)`: local snapshots never contain removed entries,
//! while a cloud snapshot may hold a live and a trashed entry under the same
//! name at once.

use std::collections::HashMap;

use super::metadata_item::{CloudMetadataItem, LocalMetadataItem, MetadataItem};

/// Snapshot of the local directory
pub type LocalContents = Contents<LocalMetadataItem>;
/// Snapshot of the cloud container, trash included
pub type CloudContents = Contents<CloudMetadataItem>;

type Key<'a> = (&'a str, bool);

fn key_of<T: MetadataItem>(item: &T) -> Key<'_> {
    (item.file_name(), item.is_removed())
}

// ============================================================================
// ContentsUpdate
// ============================================================================

/// Delta between two snapshots of the same store
#[derive(Debug, Clone, PartialEq)]
pub struct ContentsUpdate<T> {
    pub added: Vec<T>,
    pub updated: Vec<T>,
    pub removed: Vec<T>,
}

impl<T> Default for ContentsUpdate<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<T: MetadataItem> ContentsUpdate<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every distinct file name touched by this delta, in first-seen order
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for item in self.added.iter().chain(&self.updated).chain(&self.removed) {
            if !names.iter().any(|n| n == item.file_name()) {
                names.push(item.file_name().to_string());
            }
        }
        names
    }
}

// ============================================================================
// Contents
// ============================================================================

/// Snapshot of one store
#[derive(Debug, Clone)]
pub struct Contents<T> {
    items: Vec<T>,
}

impl<T> Default for Contents<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: MetadataItem> Contents<T> {
    /// Builds a snapshot; later duplicates of the same key replace earlier ones
    pub fn new(items: Vec<T>) -> Self {
        let mut contents = Self::default();
        for item in items {
            contents.upsert(item);
        }
        contents
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Entries that are not in the trash
    pub fn live_items(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter(|item| !item.is_removed())
    }

    /// Entries that are in the trash
    pub fn trashed_items(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter(|item| item.is_removed())
    }

    /// Live entry with the given name
    pub fn live_item(&self, file_name: &str) -> Option<&T> {
        self.find((file_name, false))
    }

    /// Trashed entry with the given name
    pub fn trashed_item(&self, file_name: &str) -> Option<&T> {
        self.find((file_name, true))
    }

    /// Applies a delta in place
    ///
    /// Removals are applied first, then additions and updates, which both
    /// replace an entry with the same key or insert it.
    pub fn apply(&mut self, update: &ContentsUpdate<T>) {
        for item in &update.removed {
            let key = key_of(item);
            self.items.retain(|existing| key_of(existing) != key);
        }
        for item in update.added.iter().chain(&update.updated) {
            self.upsert(item.clone());
        }
    }

    /// Computes the delta that turns `self` into `newer`
    pub fn diff(&self, newer: &Self) -> ContentsUpdate<T> {
        let old: HashMap<Key<'_>, &T> = self.items.iter().map(|i| (key_of(i), i)).collect();
        let new: HashMap<Key<'_>, &T> = newer.items.iter().map(|i| (key_of(i), i)).collect();

        let mut update = ContentsUpdate::default();
        for item in &newer.items {
            match old.get(&key_of(item)) {
                None => update.added.push(item.clone()),
                Some(previous) if *previous != item => update.updated.push(item.clone()),
                Some(_) => {}
            }
        }
        for item in &self.items {
            if !new.contains_key(&key_of(item)) {
                update.removed.push(item.clone());
            }
        }
        update
    }

    fn find(&self, key: Key<'_>) -> Option<&T> {
        self.items.iter().find(|item| key_of(*item) == key)
    }

    fn upsert(&mut self, item: T) {
        let position = self
            .items
            .iter()
            .position(|existing| key_of(existing) == key_of(&item));
        match position {
            Some(index) => self.items[index] = item,
            None => self.items.push(item),
        }
    }
}

/// Snapshots compare equal when they hold the same entries in any order
impl<T: MetadataItem> PartialEq for Contents<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .all(|item| other.find(key_of(item)) == Some(item))
    }
}

impl<T: MetadataItem> FromIterator<T> for Contents<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// ============================================================================
// Cloud-specific queries
// ============================================================================

impl Contents<CloudMetadataItem> {
    /// Returns the trashed entry if the name counts as removed
    ///
    /// A trashed entry wins when there is no live entry, or when it is at
    /// least as recent as the live one. A strictly newer live entry means the
    /// file was recreated after the deletion.
    pub fn effective_removal(&self, file_name: &str) -> Option<&CloudMetadataItem> {
        let trashed = self.trashed_item(file_name)?;
        match self.live_item(file_name) {
            Some(live) if live.is_newer_than(trashed) => None,
            _ => Some(trashed),
        }
    }

    /// Live entries that still need their versions reconciled
    pub fn items_with_unresolved_conflicts(&self) -> impl Iterator<Item = &CloudMetadataItem> {
        self.live_items().filter(|item| item.has_unresolved_conflicts())
    }
}
