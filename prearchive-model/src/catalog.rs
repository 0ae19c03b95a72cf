//! Catalog trees: the file manifest attached to one resource.
//!
//! A catalog is an ordered set of entries plus nested sub-catalogs. Entries
//! may be identified two ways: by a content-level unique id (e.g. a DICOM
//! instance UID) or by their relative path. The merge engine in
//! `prearchive-core` needs to compare the *identity* of entries found
//! through either strategy, so lookups return an [`EntryLocator`] — a stable
//! position within the tree — rather than bare references.

/// One file reference inside a catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CatalogEntry {
    pub id: String,
    /// Relative path of the file below the catalog's root directory.
    pub uri: String,
    pub size: Option<u64>,
    pub checksum: Option<String>,
    /// Content-level unique identifier, when the file carries one.
    pub content_uid: Option<String>,
    pub format: Option<String>,
}

impl CatalogEntry {
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            size: None,
            checksum: None,
            content_uid: None,
            format: None,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.content_uid = Some(uid.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// Position of an entry within a catalog tree: the sub-catalog path followed
/// by the entry index. Two locators are equal iff they name the same entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryLocator {
    pub sets: Vec<usize>,
    pub index: usize,
}

/// A manifest of file entries for one resource, possibly nested.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Catalog {
    pub id: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub entries: Vec<CatalogEntry>,
    /// Nested sub-catalogs.
    #[cfg_attr(feature = "serde", serde(default))]
    pub sets: Vec<Catalog>,
}

impl Catalog {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: Vec::new(),
            sets: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, entry: CatalogEntry) {
        self.entries.push(entry);
    }

    /// Total entry count across the whole tree.
    pub fn total_entries(&self) -> usize {
        self.entries.len() + self.sets.iter().map(Catalog::total_entries).sum::<usize>()
    }

    /// Sum of known entry sizes across the whole tree.
    pub fn total_size(&self) -> u64 {
        self.entries
            .iter()
            .filter_map(|e| e.size)
            .chain(self.sets.iter().map(Catalog::total_size))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_entries() == 0
    }

    /// Depth-first iterator over every entry in the tree.
    pub fn all_entries(&self) -> Vec<&CatalogEntry> {
        let mut out: Vec<&CatalogEntry> = self.entries.iter().collect();
        for set in &self.sets {
            out.extend(set.all_entries());
        }
        out
    }

    pub fn locate_by_uid(&self, uid: &str) -> Option<EntryLocator> {
        self.locate(&|e: &CatalogEntry| e.content_uid.as_deref() == Some(uid))
    }

    pub fn locate_by_uri(&self, uri: &str) -> Option<EntryLocator> {
        self.locate(&|e: &CatalogEntry| e.uri == uri)
    }

    /// Depth-first search for the first entry matching `pred`.
    pub fn locate(&self, pred: &dyn Fn(&CatalogEntry) -> bool) -> Option<EntryLocator> {
        let mut path = Vec::new();
        self.locate_inner(pred, &mut path)
    }

    fn locate_inner(
        &self,
        pred: &dyn Fn(&CatalogEntry) -> bool,
        path: &mut Vec<usize>,
    ) -> Option<EntryLocator> {
        if let Some(index) = self.entries.iter().position(|e| pred(e)) {
            return Some(EntryLocator {
                sets: path.clone(),
                index,
            });
        }
        for (i, set) in self.sets.iter().enumerate() {
            path.push(i);
            if let Some(found) = set.locate_inner(pred, path) {
                return Some(found);
            }
            path.pop();
        }
        None
    }

    pub fn entry(&self, loc: &EntryLocator) -> Option<&CatalogEntry> {
        let mut cat = self;
        for &i in &loc.sets {
            cat = cat.sets.get(i)?;
        }
        cat.entries.get(loc.index)
    }

    pub fn entry_mut(&mut self, loc: &EntryLocator) -> Option<&mut CatalogEntry> {
        let mut cat = self;
        for &i in &loc.sets {
            cat = cat.sets.get_mut(i)?;
        }
        cat.entries.get_mut(loc.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_catalog() -> Catalog {
        let mut inner = Catalog::new("inner");
        inner.add_entry(CatalogEntry::new("2", "sub/b.dcm").with_uid("U2"));
        let mut root = Catalog::new("root");
        root.add_entry(CatalogEntry::new("1", "a.dcm").with_uid("U1"));
        root.sets.push(inner);
        root
    }

    #[test]
    fn locate_descends_into_sets() {
        let cat = nested_catalog();
        let loc = cat.locate_by_uid("U2").unwrap();
        assert_eq!(loc.sets, vec![0]);
        assert_eq!(cat.entry(&loc).unwrap().uri, "sub/b.dcm");
    }

    #[test]
    fn locators_compare_by_position() {
        let cat = nested_catalog();
        let by_uid = cat.locate_by_uid("U1").unwrap();
        let by_uri = cat.locate_by_uri("a.dcm").unwrap();
        assert_eq!(by_uid, by_uri);
        assert_ne!(by_uid, cat.locate_by_uri("sub/b.dcm").unwrap());
    }

    #[test]
    fn totals_cover_the_whole_tree() {
        let mut cat = nested_catalog();
        cat.entries[0].size = Some(10);
        cat.sets[0].entries[0].size = Some(32);
        assert_eq!(cat.total_entries(), 2);
        assert_eq!(cat.total_size(), 42);
    }
}
