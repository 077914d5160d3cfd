// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
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

use alloc::collections::btree_map::BTreeMap;
use alloc::vec::Vec;
use core::ops::Range;

use crate::error::EpcResult;

/// Non-overlapping ranges keyed by start address, each carrying a value.
#[derive(Debug)]
pub struct IntervalTree<T> {
    tree: BTreeMap<usize, (Range<usize>, T)>,
}

pub fn overlap(left: &Range<usize>, right: &Range<usize>) -> Option<Range<usize>> {
    let overlap_start = left.start.max(right.start);
    let overlap_end = left.end.min(right.end);
    if overlap_start >= overlap_end {
        None
    } else {
        Some(overlap_start..overlap_end)
    }
}

impl<T> Default for IntervalTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IntervalTree<T> {
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
        }
    }

    /// Insert a value into the tree for a given range.
    pub fn insert(&mut self, range: Range<usize>, value: T) -> EpcResult {
        if range.start >= range.end {
            return epc_result_err!(EINVAL, format!("Empty range {:#x?}", range));
        }
        // checking to see if any overlapping occurs
        let nodes = self.tree.range(..range.end);
        if let Some((_, node)) = nodes.last() {
            if overlap(&node.0, &range).is_some() {
                return epc_result_err!(EINVAL, "Insert overlap");
            }
        }
        self.tree.insert(range.start, (range, value));
        Ok(())
    }

    /// Remove the range starting exactly at `start`.
    pub fn remove(&mut self, start: usize) -> Option<(Range<usize>, T)> {
        self.tree.remove(&start)
    }

    /// The range containing `point` and its value.
    pub fn find(&self, point: usize) -> Option<(&Range<usize>, &T)> {
        let (_, (range, value)) = self.tree.range(..=point).next_back()?;
        if range.contains(&point) {
            Some((range, value))
        } else {
            None
        }
    }

    pub fn find_mut(&mut self, point: usize) -> Option<(&Range<usize>, &mut T)> {
        let (_, (range, value)) = self.tree.range_mut(..=point).next_back()?;
        if range.contains(&point) {
            Some((&*range, value))
        } else {
            None
        }
    }

    /// Returns true if there is a range that contains the point argument.
    pub fn contains(&self, point: usize) -> bool {
        self.find(point).is_some()
    }

    pub fn contains_range(&self, range: Range<usize>) -> bool {
        match self.tree.range(..=range.start).next_back() {
            Some((_, (node, _))) => node.start <= range.start && node.end >= range.end,
            None => false,
        }
    }

    /// Returns a vec of range which overlap with a given range.
    /// For example, if the tree contains [[1000..5000], [8000..11000]], and the given range
    /// is (4000..9000), you'll get back [[4000..5000], [8000..9000]]
    pub fn get_overlap(&self, range: &Range<usize>) -> Vec<Range<usize>> {
        // We might have to look at the element immediately preceeding range.start
        let start = self
            .tree
            .range(..=range.start)
            .next_back()
            .map_or(range.start, |(start, _)| *start);
        if start >= range.end {
            return Vec::new();
        }
        self.tree
            .range(start..range.end)
            .filter_map(|(_, (var, _))| overlap(range, var))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Range<usize>, &T)> {
        self.tree.values().map(|(range, value)| (range, value))
    }

    pub fn starts(&self) -> Vec<usize> {
        self.tree.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find() {
        let mut tree = IntervalTree::new();
        tree.insert(0x1000..0x5000, 'a').unwrap();
        tree.insert(0x8000..0xb000, 'b').unwrap();
        assert!(tree.insert(0x4000..0x9000, 'c').is_err());
        assert!(tree.insert(0x6000..0x6000, 'c').is_err());

        assert_eq!(tree.find(0x4fff).map(|(_, v)| *v), Some('a'));
        assert_eq!(tree.find(0x5000), None);
        assert_eq!(tree.find(0x8000).map(|(r, _)| r.clone()), Some(0x8000..0xb000));
        assert!(tree.contains_range(0x9000..0xb000));
        assert!(!tree.contains_range(0x9000..0xc000));

        *tree.find_mut(0x9000).unwrap().1 = 'z';
        assert_eq!(tree.find(0x9000).map(|(_, v)| *v), Some('z'));
    }

    #[test]
    fn test_overlap_and_remove() {
        let mut tree = IntervalTree::new();
        tree.insert(1000..5000, ()).unwrap();
        tree.insert(8000..11000, ()).unwrap();
        assert_eq!(tree.get_overlap(&(4000..9000)), vec![4000..5000, 8000..9000]);
        assert!(tree.get_overlap(&(6000..7000)).is_empty());

        assert!(tree.remove(2000).is_none());
        assert_eq!(tree.remove(1000).map(|(r, _)| r), Some(1000..5000));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.starts(), vec![8000]);
    }
}
