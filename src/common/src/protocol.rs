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

use std::collections::HashSet;

/// The set of buffer key-strings a port declares it can produce or accept,
/// plus the single key-string selected during link negotiation.
///
/// Linking an out-port to an in-port intersects the two sets; an empty
/// intersection fails the link, otherwise one common element becomes the
/// selected key-string on both sides.
#[derive(Debug, Clone, Default)]
pub struct Protocol {
    set: HashSet<String>,
    selected: Option<String>,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a protocol accepting each of `keys`.
    pub fn accepting<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            set: keys.into_iter().map(Into::into).collect(),
            selected: None,
        }
    }

    pub fn accept(&mut self, key: impl Into<String>) -> &mut Self {
        self.set.insert(key.into());
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.set.contains(key)
    }

    /// Key-strings offered by both protocols.
    pub fn overlap(&self, other: &Protocol) -> HashSet<String> {
        self.set.intersection(&other.set).cloned().collect()
    }

    /// Mark `key` as the negotiated key-string. Fails when `key` is not in
    /// the accepted set.
    pub fn select(&mut self, key: &str) -> bool {
        if self.set.contains(key) {
            self.selected = Some(key.to_owned());
            true
        } else {
            false
        }
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn has_selected(&self) -> bool {
        self.selected.is_some()
    }

    pub fn clear_selected(&mut self) {
        self.selected = None;
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.set.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&str> = self.set.iter().map(String::as_str).collect();
        keys.sort_unstable();
        write!(f, "{{{}}}", keys.join(","))
    }
}
