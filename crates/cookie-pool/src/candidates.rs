//! Per-request candidate rotation
//!
//! A request picks its first cookie at random and then walks the rest of
//! the list in order, without wrapping. Picking rotates the list so the
//! chosen cookie sits at the front, which makes "every candidate at most
//! once" a plain cursor bound.

use rand::RngExt;

use crate::error::{Error, Result};
use crate::pool::Cookie;

#[derive(Debug, Clone)]
pub struct CandidateList {
    items: Vec<Cookie>,
    cursor: usize,
}

impl CandidateList {
    pub(crate) fn new(items: Vec<Cookie>) -> Self {
        Self { items, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.items.iter()
    }

    /// Choose the starting cookie uniformly at random.
    pub fn pick_random(&mut self) -> Result<Cookie> {
        if self.items.is_empty() {
            return Err(Error::Exhausted("no candidate cookies".into()));
        }
        let start = rand::rng().random_range(0..self.items.len());
        self.items.rotate_left(start);
        self.cursor = 0;
        Ok(self.items[0].clone())
    }

    /// Move to the next cookie after the current one.
    pub fn advance(&mut self) -> Result<Cookie> {
        let next = self.cursor + 1;
        if next >= self.items.len() {
            return Err(Error::Exhausted(format!(
                "all {} candidate cookies tried",
                self.items.len()
            )));
        }
        self.cursor = next;
        Ok(self.items[next].clone())
    }
}
