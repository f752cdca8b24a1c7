// Copyright 2025 FusionFlow Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// Object-safe bound for values stored in a [`MetaMap`].
///
/// Blanket-implemented for every `Clone + Send + Sync + 'static` type, so
/// user code never implements this trait by hand.
pub trait Meta: Any + Send + Sync {
    fn clone_boxed(&self) -> Box<dyn Meta>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Clone + Send + Sync> Meta for T {
    fn clone_boxed(&self) -> Box<dyn Meta> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Heterogeneous metadata map keyed by value type.
///
/// Each map holds at most one value per type; inserting a second value of
/// the same type overwrites the first. A miss on [`MetaMap::get`] returns
/// `None` rather than failing. Type identity stays internal to this
/// module; callers only ever name concrete types.
#[derive(Default)]
pub struct MetaMap {
    entries: HashMap<TypeId, Box<dyn Meta>>,
}

impl MetaMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value`, replacing any previous value of the same type.
    pub fn set<T: Meta>(&mut self, value: T) {
        self.entries.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Meta>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|meta| (&**meta as &dyn Any).downcast_ref::<T>())
    }

    /// Remove the value of type `T`, reporting whether one was present.
    pub fn erase<T: Meta>(&mut self) -> bool {
        self.entries.remove(&TypeId::of::<T>()).is_some()
    }

    pub fn contains<T: Meta>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn erase_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Clone for MetaMap {
    fn clone(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(id, meta)| (*id, Meta::clone_boxed(&**meta)))
                .collect(),
        }
    }
}

impl fmt::Debug for MetaMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaMap")
            .field("len", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct InferenceTag(String);

    #[derive(Clone, Debug, PartialEq)]
    struct Score(f64);

    #[test]
    fn test_one_value_per_type() {
        let mut map = MetaMap::new();
        map.set(InferenceTag("person".into()));
        map.set(Score(0.5));
        map.set(InferenceTag("vehicle".into()));

        assert_eq!(map.len(), 2);
        assert_eq!(map.get::<InferenceTag>().unwrap().0, "vehicle");
        assert_eq!(map.get::<Score>(), Some(&Score(0.5)));
    }

    #[test]
    fn test_missing_type_is_none() {
        let map = MetaMap::new();
        assert_eq!(map.get::<Score>(), None);
        assert!(!map.contains::<Score>());
    }

    #[test]
    fn test_erase_and_erase_all() {
        let mut map = MetaMap::new();
        map.set(Score(1.0));
        assert!(map.erase::<Score>());
        assert!(!map.erase::<Score>());

        map.set(Score(2.0));
        map.set(InferenceTag("x".into()));
        map.erase_all();
        assert!(map.is_empty());
    }

    #[test]
    fn test_clone_is_deep() {
        let mut map = MetaMap::new();
        map.set(InferenceTag("a".into()));
        let mut copy = map.clone();
        copy.set(InferenceTag("b".into()));

        assert_eq!(map.get::<InferenceTag>().unwrap().0, "a");
        assert_eq!(copy.get::<InferenceTag>().unwrap().0, "b");
    }
}
