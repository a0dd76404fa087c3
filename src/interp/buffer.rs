//! Dense multi-dimensional integer buffers.

use serde::{Deserialize, Serialize};

/// A dense buffer over `[mins[d], mins[d] + extents[d])` in every
/// dimension, stored row-major with dimension 0 densest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    pub mins: Vec<i64>,
    pub extents: Vec<i64>,
    pub data: Vec<i64>,
}

impl Buffer {
    /// Zero-filled buffer. Negative extents count as empty.
    pub fn new(mins: Vec<i64>, extents: Vec<i64>) -> Self {
        let len = extents.iter().map(|e| (*e).max(0) as usize).product::<usize>();
        Self { mins, extents, data: vec![0; len] }
    }

    pub fn from_fn(mins: Vec<i64>, extents: Vec<i64>, f: impl Fn(&[i64]) -> i64) -> Self {
        let mut buffer = Self::new(mins, extents);
        let data: Vec<i64> = buffer.points().map(|p| f(&p)).collect();
        buffer.data = data;
        buffer
    }

    pub fn dimensions(&self) -> usize {
        self.extents.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn strides(&self) -> Vec<i64> {
        let mut strides = Vec::with_capacity(self.extents.len());
        let mut stride = 1;
        for e in &self.extents {
            strides.push(stride);
            stride *= (*e).max(0);
        }
        strides
    }

    pub fn contains(&self, coords: &[i64]) -> bool {
        coords.len() == self.dimensions()
            && coords
                .iter()
                .zip(self.mins.iter().zip(&self.extents))
                .all(|(c, (m, e))| *c >= *m && *c < *m + *e)
    }

    /// Flat offset of `coords`, whether or not they are inside.
    pub fn offset(&self, coords: &[i64]) -> i64 {
        coords
            .iter()
            .zip(self.mins.iter().zip(self.strides()))
            .map(|(c, (m, s))| (c - m) * s)
            .sum()
    }

    pub fn get(&self, coords: &[i64]) -> Option<i64> {
        if !self.contains(coords) {
            return None;
        }
        self.data.get(self.offset(coords) as usize).copied()
    }

    /// Write a value; returns false if `coords` is outside.
    pub fn set(&mut self, coords: &[i64], value: i64) -> bool {
        if !self.contains(coords) {
            return false;
        }
        let offset = self.offset(coords) as usize;
        match self.data.get_mut(offset) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Every coordinate in storage order.
    pub fn points(&self) -> impl Iterator<Item = Vec<i64>> + '_ {
        (0..self.len()).map(move |mut i| {
            let mut point = Vec::with_capacity(self.dimensions());
            for (m, e) in self.mins.iter().zip(&self.extents) {
                let e = (*e).max(1) as usize;
                point.push(m + (i % e) as i64);
                i /= e;
            }
            point
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let b = Buffer::from_fn(vec![-1, 10], vec![3, 2], |p| p[0] * 100 + p[1]);
        assert_eq!(b.strides(), vec![1, 3]);
        assert_eq!(b.len(), 6);
        assert_eq!(b.data[0], -90);
        assert_eq!(b.get(&[1, 11]), Some(111));
        assert_eq!(b.get(&[2, 11]), None);
        assert_eq!(b.offset(&[0, 11]), 4);
    }

    #[test]
    fn test_empty_and_scalar() {
        let empty = Buffer::new(vec![0], vec![0]);
        assert!(empty.is_empty());
        assert_eq!(empty.points().count(), 0);
        let mut scalar = Buffer::new(vec![], vec![]);
        assert_eq!(scalar.len(), 1);
        assert!(scalar.set(&[], 7));
        assert_eq!(scalar.get(&[]), Some(7));
    }
}
