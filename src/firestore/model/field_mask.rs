use std::collections::BTreeSet;

use crate::firestore::model::FieldPath;

/// Set of field paths touched by a patch. A mask covers a path when one of
/// its entries is a prefix of it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    pub fn union(mut self, other: &FieldMask) -> Self {
        self.fields.extend(other.fields.iter().cloned());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_nested_paths() {
        let mask = FieldMask::new([FieldPath::from_dot_separated("a").unwrap()]);
        assert!(mask.covers(&FieldPath::from_dot_separated("a.b").unwrap()));
        assert!(!mask.covers(&FieldPath::from_dot_separated("b").unwrap()));
    }
}
