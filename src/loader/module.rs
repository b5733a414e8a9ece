use std::sync::Arc;

use super::name_index::{CaseInsensitiveNameIndex, Datum, EntryId, LookupCursor, NameIndex};
use super::TypeHandle;
use crate::error::NameIndexError;
use crate::util::rust_util::atomic_box::OnceOptionBox;

/// A unit of loaded types with its own name index.
///
/// Lookups never lock. Additions are serialized by the module, and so is the one-time
/// construction of the case-insensitive index, which is built on the first case-insensitive
/// lookup and kept in step with later additions.
pub struct Module {
    name: String,
    index: Arc<NameIndex>,
    case_insensitive: OnceOptionBox<CaseInsensitiveNameIndex>,
    writer: spin::Mutex<()>,
}

impl Module {
    pub fn new(name: &str, buckets: usize) -> Self {
        Module {
            name: name.to_string(),
            index: Arc::new(NameIndex::new(buckets)),
            case_insensitive: OnceOptionBox::new(),
            writer: spin::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> &NameIndex {
        &self.index
    }

    fn add(
        &self,
        namespace: &str,
        name: &str,
        datum: Datum,
        encloser: Option<EntryId>,
    ) -> Result<EntryId, NameIndexError> {
        let _writer = self.writer.lock();
        let id = self.index.insert(namespace, name, datum, encloser);
        if let Some(ci) = self.case_insensitive.get() {
            ci.add(id)?;
        }
        Ok(id)
    }

    /// Record a loaded type. Nested types pass the entry of their enclosing type.
    ///
    /// Only fails if the case-insensitive index has been built and cannot mirror the entry. The
    /// case-sensitive entry is added regardless.
    pub fn add_type(
        &self,
        ty: &TypeHandle,
        encloser: Option<EntryId>,
    ) -> Result<EntryId, NameIndexError> {
        self.add(ty.namespace(), ty.name(), Datum::Type(ty.clone()), encloser)
    }

    /// Record a type definition token that has not been loaded yet.
    pub fn add_token(
        &self,
        namespace: &str,
        name: &str,
        token: u32,
        encloser: Option<EntryId>,
    ) -> Result<EntryId, NameIndexError> {
        self.add(namespace, name, Datum::Token(token), encloser)
    }

    /// Record a type this module forwards to another one.
    pub fn add_exported_type(
        &self,
        namespace: &str,
        name: &str,
        token: u32,
        encloser: Option<EntryId>,
    ) -> Result<EntryId, NameIndexError> {
        self.add(namespace, name, Datum::ExportedTypeToken(token), encloser)
    }

    /// A top-level type.
    pub fn find(&self, namespace: &str, name: &str) -> Option<EntryId> {
        self.index
            .find(namespace, name, false, &mut LookupCursor::default())
    }

    /// A type nested directly in `encloser`.
    pub fn find_nested(&self, encloser: EntryId, namespace: &str, name: &str) -> Option<EntryId> {
        let mut cursor = LookupCursor::default();
        let mut found = self.index.find(namespace, name, true, &mut cursor);
        while let Some(id) = found {
            if self.encloser_of(id) == Some(encloser) {
                return Some(id);
            }
            found = self.index.find_next_nested(namespace, name, &mut cursor);
        }
        None
    }

    /// Follow a path of simple names from a top-level type in `namespace` down through nested
    /// types.
    pub fn resolve_nested(&self, namespace: &str, path: &[&str]) -> Option<EntryId> {
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(self.find(namespace, first)?, |outer, name| {
                self.find_nested(outer, "", name)
            })
    }

    fn case_insensitive(&self) -> Result<&CaseInsensitiveNameIndex, NameIndexError> {
        if let Some(ci) = self.case_insensitive.get() {
            return Ok(ci);
        }
        let _writer = self.writer.lock();
        if let Some(ci) = self.case_insensitive.get() {
            return Ok(ci);
        }
        let ci = self.index.make_case_insensitive()?;
        debug!("Module {}: case-insensitive index ready", self.name);
        Ok(self.case_insensitive.publish_or_get(ci))
    }

    /// Like `find`, ignoring case. Builds the case-insensitive index on first use.
    pub fn find_case_insensitive(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EntryId>, NameIndexError> {
        self.case_insensitive()?
            .find(namespace, name, false, &mut LookupCursor::default())
    }

    /// Like `find_nested`, ignoring case.
    pub fn find_nested_case_insensitive(
        &self,
        encloser: EntryId,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EntryId>, NameIndexError> {
        let ci = self.case_insensitive()?;
        let mut cursor = LookupCursor::default();
        let mut found = ci.find(namespace, name, true, &mut cursor)?;
        while let Some(id) = found {
            if self.encloser_of(id) == Some(encloser) {
                return Ok(Some(id));
            }
            found = ci.find_next_nested(namespace, name, &mut cursor)?;
        }
        Ok(None)
    }

    pub fn encloser_of(&self, id: EntryId) -> Option<EntryId> {
        self.index.entry(id).and_then(|e| e.encloser())
    }

    pub fn datum(&self, id: EntryId) -> Option<&Datum> {
        self.index.entry(id).map(|e| e.datum())
    }

    /// The loaded type an entry names, if it has been loaded.
    pub fn type_of(&self, id: EntryId) -> Option<TypeHandle> {
        match self.datum(id)? {
            Datum::Type(ty) => Some(ty.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("types", &self.index.len())
            .field("case_insensitive", &self.case_insensitive.is_published())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> Module {
        Module::new("test", 16)
    }

    #[test]
    fn nested_lookup_follows_the_encloser() {
        let m = module();
        let list = m.add_token("Collections", "List", 1, None).unwrap();
        let dict = m.add_token("Collections", "Dictionary", 2, None).unwrap();
        let list_enum = m.add_token("", "Enumerator", 3, Some(list)).unwrap();
        let dict_enum = m.add_token("", "Enumerator", 4, Some(dict)).unwrap();

        assert_eq!(m.find_nested(list, "", "Enumerator"), Some(list_enum));
        assert_eq!(m.find_nested(dict, "", "Enumerator"), Some(dict_enum));
        assert_eq!(m.find("", "Enumerator"), None);
        assert_eq!(
            m.resolve_nested("Collections", &["Dictionary", "Enumerator"]),
            Some(dict_enum)
        );
        assert_eq!(m.resolve_nested("Collections", &["Set", "Enumerator"]), None);
        assert_eq!(m.datum(dict_enum), Some(&Datum::Token(4)));
    }

    #[test]
    fn case_insensitive_index_is_built_lazily_and_kept_current() {
        let m = module();
        let a = m.add_token("App", "Widget", 1, None).unwrap();
        assert!(!m.case_insensitive.is_published());
        assert_eq!(m.find_case_insensitive("app", "WIDGET"), Ok(Some(a)));
        assert!(m.case_insensitive.is_published());

        let b = m.add_token("App", "Gadget", 2, None).unwrap();
        assert_eq!(m.find_case_insensitive("APP", "gadget"), Ok(Some(b)));
        let inner = m.add_token("", "Part", 3, Some(b)).unwrap();
        assert_eq!(m.find_nested_case_insensitive(b, "", "PART"), Ok(Some(inner)));
        assert_eq!(m.find_nested_case_insensitive(a, "", "part"), Ok(None));
    }

    #[test]
    fn exported_types_keep_their_kind() {
        let m = module();
        let id = m.add_exported_type("Lib", "Forwarded", 7, None).unwrap();
        assert_eq!(m.datum(id), Some(&Datum::ExportedTypeToken(7)));
        assert!(m.type_of(id).is_none());
    }
}
