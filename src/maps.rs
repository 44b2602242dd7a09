use std::collections::HashMap;
use std::hash::Hash;

type InnerMap<K2, V> = HashMap<K2, V, ahash::RandomState>;

/// A two-dimensional map: values are addressed by an ordered key pair.
///
/// Backed by nested hash maps with a live entry counter, so `len` is O(1)
/// while joint lookup, filtered removal and iteration stay cheap. Empty
/// inner maps are dropped eagerly.
pub struct KeyPairMap<K1, K2, V> {
  outer: HashMap<K1, InnerMap<K2, V>, ahash::RandomState>,
  len: usize,
}

impl<K1, K2, V> KeyPairMap<K1, K2, V> {
  pub fn new() -> Self {
    Self {
      outer: HashMap::default(),
      len: 0,
    }
  }

  /// Number of (K1, K2) entries.
  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn iter(&self) -> impl Iterator<Item = (&K1, &K2, &V)> {
    self
      .outer
      .iter()
      .flat_map(|(k1, inner)| inner.iter().map(move |(k2, value)| (k1, k2, value)))
  }

  /// Consumes the map, yielding every value.
  pub fn into_values(self) -> impl Iterator<Item = V> {
    self.outer.into_values().flat_map(InnerMap::into_values)
  }

  pub fn clear(&mut self) {
    self.outer.clear();
    self.len = 0;
  }
}

impl<K1, K2, V> KeyPairMap<K1, K2, V>
where
  K1: Eq + Hash,
  K2: Eq + Hash,
{
  pub fn get(&self, k1: &K1, k2: &K2) -> Option<&V> {
    self.outer.get(k1)?.get(k2)
  }

  pub fn contains(&self, k1: &K1, k2: &K2) -> bool {
    self.get(k1, k2).is_some()
  }

  /// Inserts a value, returning the previous one for the pair, if any.
  pub fn insert(&mut self, k1: K1, k2: K2, value: V) -> Option<V> {
    let inner = self.outer.entry(k1).or_default();
    let previous = inner.insert(k2, value);
    if previous.is_none() {
      self.len += 1;
    }
    previous
  }

  /// Removes and returns the value for the pair, if any.
  pub fn remove(&mut self, k1: &K1, k2: &K2) -> Option<V> {
    let inner = self.outer.get_mut(k1)?;
    let removed = inner.remove(k2);
    if removed.is_some() {
      self.len -= 1;
      if inner.is_empty() {
        self.outer.remove(k1);
      }
    }
    removed
  }

  /// Removes every entry under `k1`, returning the removed values.
  pub fn remove_outer(&mut self, k1: &K1) -> Vec<V> {
    match self.outer.remove(k1) {
      Some(inner) => {
        self.len -= inner.len();
        inner.into_values().collect()
      }
      None => Vec::new(),
    }
  }

  /// Keeps only the entries for which `keep` returns true.
  pub fn retain<F>(&mut self, mut keep: F)
  where
    F: FnMut(&K1, &K2, &V) -> bool,
  {
    let mut removed = 0usize;
    self.outer.retain(|k1, inner| {
      inner.retain(|k2, value| {
        if keep(k1, k2, value) {
          true
        } else {
          removed += 1;
          false
        }
      });
      !inner.is_empty()
    });
    self.len -= removed;
  }
}

impl<K1, K2, V> Default for KeyPairMap<K1, K2, V> {
  fn default() -> Self {
    Self::new()
  }
}
