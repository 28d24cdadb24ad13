//! Node descriptors and the bounded partial view.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::PeerId;

/// What one node knows about another: its identity, how many gossip
/// rounds have passed since information from it was last fresh, and any
/// extension-contributed fields (the media layer publishes the parts it
/// holds per URL here).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub id: PeerId,
    pub age: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Descriptor {
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self::with_age(id, 0)
    }

    pub fn with_age(id: impl Into<PeerId>, age: u32) -> Self {
        Self {
            id: id.into(),
            age,
            extra: Map::new(),
        }
    }

    /// Returns a copy advertising this node right now (age zero).
    pub fn fresh(&self) -> Self {
        let mut descriptor = self.clone();
        descriptor.age = 0;
        descriptor
    }

    /// Sets an extension field addressed by a path of object keys,
    /// creating intermediate objects as needed. Path segments are
    /// separate strings because media URLs themselves contain dots.
    pub fn set_path(&mut self, path: &[String], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut cursor = &mut self.extra;
        for segment in parents {
            let slot = cursor
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            match slot.as_object_mut() {
                Some(map) => cursor = map,
                None => return,
            }
        }
        cursor.insert(last.clone(), value);
    }

    /// Reads an extension field by path.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut cursor = self.extra.get(*first)?;
        for segment in rest {
            cursor = cursor.as_object()?.get(*segment)?;
        }
        Some(cursor)
    }
}

/// An ordered, bounded set of descriptors.
///
/// Invariants: no duplicate ids, the owner's id absent, size at most the
/// configured `C`. The merge in [`crate::gossip::merge_view`] maintains
/// all three.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct View(Vec<Descriptor>);

impl View {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: Vec<Descriptor>) -> Self {
        Self(descriptors)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.0.iter()
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.0
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.position(id).is_some()
    }

    pub fn position(&self, id: &PeerId) -> Option<usize> {
        self.0.iter().position(|descriptor| descriptor.id == *id)
    }

    pub fn push(&mut self, descriptor: Descriptor) {
        self.0.push(descriptor);
    }

    pub fn replace(&mut self, index: usize, descriptor: Descriptor) {
        self.0[index] = descriptor;
    }

    pub fn remove(&mut self, index: usize) -> Descriptor {
        self.0.remove(index)
    }

    pub fn sort_by_age(&mut self) {
        self.0.sort_by_key(|descriptor| descriptor.age);
    }

    /// One gossip round has passed for everything in the view.
    pub fn age_all(&mut self) {
        for descriptor in &mut self.0 {
            descriptor.age = descriptor.age.saturating_add(1);
        }
    }

    /// The descriptor with the highest age.
    pub fn oldest(&self) -> Option<&Descriptor> {
        self.0.iter().max_by_key(|descriptor| descriptor.age)
    }
}

impl<'a> IntoIterator for &'a View {
    type Item = &'a Descriptor;
    type IntoIter = std::slice::Iter<'a, Descriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
