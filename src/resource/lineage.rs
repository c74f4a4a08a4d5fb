use super::record::ObjectId;

/// One hop in a resource's ancestry: the parent and the relationship
/// through which the child was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageEntry {
    pub relation: String,
    pub type_name: String,
    pub object: ObjectId,
}

/// Ordered ancestor chain, root first.
///
/// Built incrementally by [`ResourceLineage::extend`] when navigating a
/// relationship; never re-derived by walking back-references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLineage {
    entries: Vec<LineageEntry>,
}

impl ResourceLineage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lineage of a child reached from `parent` through `relation`.
    pub fn extend(&self, relation: &str, type_name: &str, parent: ObjectId) -> Self {
        let mut entries = self.entries.clone();
        entries.push(LineageEntry {
            relation: relation.to_string(),
            type_name: type_name.to_string(),
            object: parent,
        });
        Self { entries }
    }

    pub fn parent(&self) -> Option<&LineageEntry> {
        self.entries.last()
    }

    /// Ancestors of the given type, root first.
    pub fn records_of(&self, type_name: &str) -> Vec<ObjectId> {
        self.entries
            .iter()
            .filter(|entry| entry.type_name == type_name)
            .map(|entry| entry.object)
            .collect()
    }

    pub fn contains(&self, object: ObjectId) -> bool {
        self.entries.iter().any(|entry| entry.object == object)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LineageEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_keeps_parent_chain_intact() {
        let root = ResourceLineage::new();
        let child = root.extend("books", "author", ObjectId(1));
        let grandchild = child.extend("chapters", "book", ObjectId(2));

        assert!(root.is_empty());
        assert_eq!(child.len(), 1);
        assert_eq!(grandchild.len(), 2);
        assert_eq!(grandchild.parent().map(|p| p.relation.as_str()), Some("chapters"));
        assert_eq!(grandchild.records_of("author"), vec![ObjectId(1)]);
        assert!(grandchild.contains(ObjectId(2)));
        assert!(!child.contains(ObjectId(2)));
    }
}
