//! Class schemas and the ordered class registry.
//!
//! Objects on the wire reference a class by a small integer id; the class
//! fixes the number of fields and the decoding context of each. Classes can
//! be declared in-stream (then the registry owns them) or registered by the
//! application from static definitions.

use crate::codec::enums::ContextId;
use core::ops::Deref;
use derive_new::new;

/// Class identifier. Ids below 16 use the short object opcode form.
pub type ClassId = u16;

/// One field of a class schema.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct ClassField {
    /// Field name; `None` for unnamed classes.
    pub name: Option<String>,
    /// Context in which the field's value is encoded.
    pub ctxid: ContextId,
}

/// A class schema: id, optional name, ordered fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    pub classid: ClassId,
    /// Class name; `None` for short (unnamed) classes.
    pub name: Option<String>,
    pub fields: Vec<ClassField>,
}

impl ClassDef {
    pub fn nfields(&self) -> usize {
        self.fields.len()
    }

    /// True when the class and all of its fields carry names.
    pub fn is_named(&self) -> bool {
        self.name.is_some()
    }
}

/// A registered class and who owns it.
///
/// `Owned` schemas (typically decoded from a stream) are dropped when
/// replaced or when the registry is reset; `Borrowed` schemas are static
/// application definitions that outlive every registry.
#[derive(Debug, Clone)]
pub enum ClassRef {
    Owned(Box<ClassDef>),
    Borrowed(&'static ClassDef),
}

impl Deref for ClassRef {
    type Target = ClassDef;

    fn deref(&self) -> &ClassDef {
        match self {
            ClassRef::Owned(c) => c,
            ClassRef::Borrowed(c) => c,
        }
    }
}

/// Ordered collection of class schemas, keyed by id.
///
/// Kept sorted by ascending id; lookup by id is a binary search, lookup by
/// name a linear scan (names are not required to be unique, the first match
/// wins).
#[derive(Debug, Default, Clone)]
pub struct ClassCollection {
    classes: Vec<ClassRef>,
}

impl ClassCollection {
    pub const fn new() -> Self {
        ClassCollection {
            classes: Vec::new(),
        }
    }

    /// Inserts a class, replacing any existing class with the same id.
    /// The replaced schema is dropped according to its ownership.
    pub fn set(&mut self, class: ClassRef) {
        match self
            .classes
            .binary_search_by_key(&class.classid, |c| c.classid)
        {
            Ok(slot) => self.classes[slot] = class,
            Err(slot) => self.classes.insert(slot, class),
        }
    }

    /// Looks a class up by id.
    pub fn get(&self, classid: ClassId) -> Option<&ClassDef> {
        self.classes
            .binary_search_by_key(&classid, |c| c.classid)
            .ok()
            .map(|slot| &*self.classes[slot])
    }

    /// Looks a class up by name. Linear in the number of registered classes.
    pub fn by_name(&self, name: &str) -> Option<&ClassDef> {
        self.classes
            .iter()
            .find(|c| c.name.as_deref() == Some(name))
            .map(|c| &**c)
    }

    /// Drops every registered class.
    pub fn reset(&mut self) {
        self.classes.clear();
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(id: ClassId, name: Option<&str>, nfields: usize) -> ClassRef {
        ClassRef::Owned(Box::new(ClassDef {
            classid: id,
            name: name.map(str::to_owned),
            fields: (0..nfields)
                .map(|_| ClassField::new(None, ContextId::Global))
                .collect(),
        }))
    }

    #[test]
    fn set_keeps_ids_ordered_and_replaces() {
        let mut coll = ClassCollection::new();
        coll.set(class(7, None, 1));
        coll.set(class(2, None, 2));
        coll.set(class(4, None, 3));
        assert_eq!(coll.len(), 3);
        assert_eq!(coll.get(2).unwrap().nfields(), 2);
        assert_eq!(coll.get(4).unwrap().nfields(), 3);
        assert_eq!(coll.get(7).unwrap().nfields(), 1);
        assert!(coll.get(5).is_none());

        // Replacing keeps the count and updates in place.
        coll.set(class(4, None, 5));
        assert_eq!(coll.len(), 3);
        assert_eq!(coll.get(4).unwrap().nfields(), 5);
    }

    #[test]
    fn lookup_by_name_first_match_wins() {
        let mut coll = ClassCollection::new();
        coll.set(class(1, Some("position"), 2));
        coll.set(class(9, Some("position"), 4));
        assert_eq!(coll.by_name("position").unwrap().classid, 1);
        assert!(coll.by_name("missing").is_none());
    }

    #[test]
    fn reset_drops_everything() {
        let mut coll = ClassCollection::new();
        coll.set(class(1, None, 0));
        coll.reset();
        assert!(coll.is_empty());
        assert!(coll.get(1).is_none());
    }
}
