//! Per-module lookup of (namespace, name) pairs.
//!
//! Entries are append-only. Each bucket is the head of a singly linked chain threaded through the
//! entries, newest first. An entry's link is written before the entry is pushed, and the bucket
//! head is updated with a release store afterwards, so readers walk chains without locking while
//! a single writer prepends to them.
//!
//! The case-insensitive index is built from a case-sensitive one. Its entries carry no strings:
//! each one redirects to the primary entry it was made from, and comparisons fold the primary's
//! strings on the fly. Folding the query allocates, so only case-insensitive lookups can fail.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::NameIndexError;
use crate::loader::TypeHandle;

/// Index of an entry in its `NameIndex`. Stable for the life of the index.
pub type EntryId = usize;

/// What a name resolves to.
#[derive(Clone, Debug)]
pub enum Datum {
    /// A type definition token that has not been loaded yet.
    Token(u32),
    /// A token of a type forwarded to another module.
    ExportedTypeToken(u32),
    Type(TypeHandle),
    /// In a case-insensitive index: the primary entry this one stands for.
    Redirect(EntryId),
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Token(a), Datum::Token(b)) => a == b,
            (Datum::ExportedTypeToken(a), Datum::ExportedTypeToken(b)) => a == b,
            (Datum::Type(a), Datum::Type(b)) => Arc::ptr_eq(a, b),
            (Datum::Redirect(a), Datum::Redirect(b)) => a == b,
            _ => false,
        }
    }
}

pub struct NameEntry {
    namespace: Arc<str>,
    name: Arc<str>,
    datum: Datum,
    /// The entry of the enclosing type, for nested types.
    encloser: Option<EntryId>,
    hash: u32,
    next: Option<EntryId>,
}

impl NameEntry {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datum(&self) -> &Datum {
        &self.datum
    }

    pub fn encloser(&self) -> Option<EntryId> {
        self.encloser
    }

    pub fn is_nested(&self) -> bool {
        self.encloser.is_some()
    }
}

impl std::fmt::Debug for NameEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameEntry")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("datum", &self.datum)
            .field("encloser", &self.encloser)
            .finish()
    }
}

/// Position in a bucket chain, so a lookup can be continued past a match.
#[derive(Clone, Debug, Default)]
pub struct LookupCursor {
    hash: u32,
    next: Option<EntryId>,
}

const NAME_SEPARATOR: u8 = b'.';

fn hash_bytes(namespace: impl Iterator<Item = u8>, name: impl Iterator<Item = u8>) -> u32 {
    namespace
        .chain(std::iter::once(NAME_SEPARATOR))
        .chain(name)
        .fold(5381u32, |h, b| h.wrapping_mul(33) ^ b as u32)
}

fn hash_name(namespace: &str, name: &str) -> u32 {
    hash_bytes(namespace.bytes(), name.bytes())
}

/// Lower-case `s` into a fresh string, reporting allocation failure instead of aborting.
fn fold_case(s: &str) -> Result<String, NameIndexError> {
    let oom = |_| NameIndexError::OutOfMemory { requested: s.len() };
    let mut folded = String::new();
    folded.try_reserve(s.len()).map_err(oom)?;
    for c in s.chars().flat_map(char::to_lowercase) {
        if folded.capacity() - folded.len() < c.len_utf8() {
            folded.try_reserve(c.len_utf8()).map_err(oom)?;
        }
        folded.push(c);
    }
    Ok(folded)
}

fn eq_folded(original: &str, folded: &str) -> bool {
    original.chars().flat_map(char::to_lowercase).eq(folded.chars())
}

/// A case-sensitive name index.
pub struct NameIndex {
    entries: boxcar::Vec<NameEntry>,
    /// Head of each chain as `id + 1`; 0 is an empty bucket.
    buckets: Box<[AtomicUsize]>,
    writer: spin::Mutex<()>,
}

impl NameIndex {
    pub fn new(buckets: usize) -> Self {
        assert!(buckets > 0);
        NameIndex {
            entries: boxcar::Vec::new(),
            buckets: (0..buckets).map(|_| AtomicUsize::new(0)).collect(),
            writer: spin::Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, id: EntryId) -> Option<&NameEntry> {
        self.entries.get(id)
    }

    fn bucket(&self, hash: u32) -> &AtomicUsize {
        &self.buckets[hash as usize % self.buckets.len()]
    }

    fn head(&self, hash: u32) -> Option<EntryId> {
        self.bucket(hash).load(Ordering::Acquire).checked_sub(1)
    }

    fn insert_hashed(
        &self,
        namespace: Arc<str>,
        name: Arc<str>,
        datum: Datum,
        encloser: Option<EntryId>,
        hash: u32,
    ) -> EntryId {
        let _writer = self.writer.lock();
        if let Some(e) = encloser {
            assert!(e < self.len(), "encloser {} is not an entry of this index", e);
        }
        let bucket = self.bucket(hash);
        let next = bucket.load(Ordering::Relaxed).checked_sub(1);
        let id = self.entries.push(NameEntry {
            namespace,
            name,
            datum,
            encloser,
            hash,
            next,
        });
        bucket.store(id + 1, Ordering::Release);
        id
    }

    /// Add an entry. Entries are never removed. Adding an existing name again shadows nothing:
    /// both entries stay findable through the cursor, newest first.
    pub fn insert(
        &self,
        namespace: &str,
        name: &str,
        datum: Datum,
        encloser: Option<EntryId>,
    ) -> EntryId {
        debug_assert!(!matches!(datum, Datum::Redirect(_)));
        let id = self.insert_hashed(
            namespace.into(),
            name.into(),
            datum,
            encloser,
            hash_name(namespace, name),
        );
        trace!("NameIndex: {}.{} -> entry {}", namespace, name, id);
        id
    }

    /// Walk the chain from the cursor to the next entry `matches` accepts.
    fn walk(
        &self,
        cursor: &mut LookupCursor,
        mut matches: impl FnMut(&NameEntry) -> bool,
    ) -> Option<EntryId> {
        while let Some(id) = cursor.next {
            let entry = self.entries.get(id)?;
            cursor.next = entry.next;
            if entry.hash == cursor.hash && matches(entry) {
                return Some(id);
            }
        }
        None
    }

    /// Find the newest entry for (`namespace`, `name`) whose nesting agrees with `is_nested`.
    /// `cursor` is reset, and can be passed to `find_next_nested` to continue.
    pub fn find(
        &self,
        namespace: &str,
        name: &str,
        is_nested: bool,
        cursor: &mut LookupCursor,
    ) -> Option<EntryId> {
        let hash = hash_name(namespace, name);
        *cursor = LookupCursor {
            hash,
            next: self.head(hash),
        };
        self.walk(cursor, |e| {
            e.is_nested() == is_nested && &*e.namespace == namespace && &*e.name == name
        })
    }

    /// Continue a lookup, considering nested entries only.
    pub fn find_next_nested(
        &self,
        namespace: &str,
        name: &str,
        cursor: &mut LookupCursor,
    ) -> Option<EntryId> {
        self.walk(cursor, |e| {
            e.is_nested() && &*e.namespace == namespace && &*e.name == name
        })
    }

    /// The chain of enclosing entries of `id`, innermost first.
    pub fn enclosers(&self, id: EntryId) -> impl Iterator<Item = EntryId> + '_ {
        std::iter::successors(self.entry(id).and_then(|e| e.encloser), move |e| {
            self.entry(*e).and_then(|e| e.encloser)
        })
    }

    /// Build the case-insensitive companion of this index. Entries added to this index later are
    /// not reflected unless also passed to `CaseInsensitiveNameIndex::add`.
    pub fn make_case_insensitive(
        self: &Arc<Self>,
    ) -> Result<CaseInsensitiveNameIndex, NameIndexError> {
        let shadow = CaseInsensitiveNameIndex {
            primary: self.clone(),
            shadow: NameIndex::new(self.buckets.len()),
        };
        for (id, _) in self.entries.iter() {
            shadow.add(id)?;
        }
        debug!(
            "NameIndex: built a case-insensitive index of {} entries",
            shadow.shadow.len()
        );
        Ok(shadow)
    }
}

impl std::fmt::Debug for NameIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameIndex")
            .field("entries", &self.len())
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

/// A case-insensitive view of a `NameIndex`. Lookups return ids of the primary index.
pub struct CaseInsensitiveNameIndex {
    primary: Arc<NameIndex>,
    shadow: NameIndex,
}

impl CaseInsensitiveNameIndex {
    pub fn primary(&self) -> &Arc<NameIndex> {
        &self.primary
    }

    /// Mirror primary entry `id`.
    pub fn add(&self, id: EntryId) -> Result<EntryId, NameIndexError> {
        let entry = self
            .primary
            .entry(id)
            .unwrap_or_else(|| panic!("entry {} is not in the primary index", id));
        let namespace = fold_case(&entry.namespace)?;
        let name = fold_case(&entry.name)?;
        let empty: Arc<str> = Arc::from("");
        // Nesting is read from the primary entry, so the shadow keeps no encloser of its own.
        Ok(self.shadow.insert_hashed(
            empty.clone(),
            empty,
            Datum::Redirect(id),
            None,
            hash_name(&namespace, &name),
        ))
    }

    /// The primary entry a shadow entry stands for.
    fn redirect(&self, shadow: &NameEntry) -> Option<(EntryId, &NameEntry)> {
        match shadow.datum {
            Datum::Redirect(id) => self.primary.entry(id).map(|e| (id, e)),
            _ => None,
        }
    }

    /// Like `NameIndex::find`, ignoring case. Returns the id of the primary entry.
    pub fn find(
        &self,
        namespace: &str,
        name: &str,
        is_nested: bool,
        cursor: &mut LookupCursor,
    ) -> Result<Option<EntryId>, NameIndexError> {
        let namespace = fold_case(namespace)?;
        let name = fold_case(name)?;
        let hash = hash_name(&namespace, &name);
        *cursor = LookupCursor {
            hash,
            next: self.shadow.head(hash),
        };
        Ok(self.walk_primary(cursor, &namespace, &name, Some(is_nested)))
    }

    /// Like `NameIndex::find_next_nested`, ignoring case.
    pub fn find_next_nested(
        &self,
        namespace: &str,
        name: &str,
        cursor: &mut LookupCursor,
    ) -> Result<Option<EntryId>, NameIndexError> {
        let namespace = fold_case(namespace)?;
        let name = fold_case(name)?;
        Ok(self.walk_primary(cursor, &namespace, &name, Some(true)))
    }

    fn walk_primary(
        &self,
        cursor: &mut LookupCursor,
        namespace: &str,
        name: &str,
        is_nested: Option<bool>,
    ) -> Option<EntryId> {
        let mut found = None;
        self.shadow.walk(cursor, |shadow| match self.redirect(shadow) {
            Some((id, e))
                if is_nested.map_or(true, |n| e.is_nested() == n)
                    && eq_folded(&e.namespace, namespace)
                    && eq_folded(&e.name, name) =>
            {
                found = Some(id);
                true
            }
            _ => false,
        })?;
        found
    }
}
