//! Container of explicitly-added elements, the base case of every fan-in.

use std::ops::Index;


/// Mutable sequence of explicitly-added elements
///
/// Keeps insertion order and allows duplicates. Has no external sources of its own; fan-ins use it
/// as the store for their known elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSequence<T> {
    items: Vec<T>,
}

impl<T> LocalSequence<T> {
    /// Construct empty
    pub fn new() -> Self {
        LocalSequence { items: Vec::new() }
    }

    /// Append an element
    pub fn add(&mut self, item: T) {
        self.items.push(item);
    }

    /// Remove the first element equal to `item`, returning whether one was found
    pub fn remove(&mut self, item: &T) -> bool
    where
        T: PartialEq,
    {
        match self.items.iter().position(|x| x == item) {
            Some(i) => {
                self.items.remove(i);
                true
            }
            None => false,
        }
    }

    /// Whether some element is equal to `item`
    pub fn contains(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        self.items.contains(item)
    }

    /// Remove all elements
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether there are no elements
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Element at `idx`, if in bounds
    pub fn get(&self, idx: usize) -> Option<&T> {
        self.items.get(idx)
    }

    /// Iterate by reference in insertion order
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T> Default for LocalSequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<usize> for LocalSequence<T> {
    type Output = T;

    fn index(&self, idx: usize) -> &T {
        &self.items[idx]
    }
}

impl<T> FromIterator<T> for LocalSequence<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        LocalSequence { items: iter.into_iter().collect() }
    }
}

impl<T> Extend<T> for LocalSequence<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}

impl<T> IntoIterator for LocalSequence<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a LocalSequence<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
