//! Detector number ↔ board channel mapping.

use crate::error::{DxpError, Result};
use std::collections::HashMap;

/// Board index and channel addressed by a detector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelAddr {
    /// Index into the registry's boards
    pub board: usize,
    /// Channel on that board
    pub channel: usize,
}

/// Bijection between caller-assigned detector numbers and board channels.
#[derive(Debug, Clone, Default)]
pub struct DetectorMap {
    forward: HashMap<i32, ChannelAddr>,
    reverse: HashMap<ChannelAddr, i32>,
    order: Vec<i32>,
}

impl DetectorMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `detector` to `(board, channel)`. Both sides must be unused.
    pub fn insert(&mut self, detector: i32, board: usize, channel: usize) -> Result<()> {
        let addr = ChannelAddr { board, channel };
        if self.forward.contains_key(&detector) {
            return Err(DxpError::bad_parameter(format!(
                "detector {detector} is already mapped"
            )));
        }
        if let Some(other) = self.reverse.get(&addr) {
            return Err(DxpError::bad_parameter(format!(
                "board {board} channel {channel} is already mapped to detector {other}"
            )));
        }
        self.forward.insert(detector, addr);
        self.reverse.insert(addr, detector);
        self.order.push(detector);
        Ok(())
    }

    /// Board channel for `detector`.
    pub fn resolve(&self, detector: i32) -> Result<ChannelAddr> {
        self.forward
            .get(&detector)
            .copied()
            .ok_or(DxpError::UnknownDetector { detector })
    }

    /// Detector mapped to `(board, channel)`, if any.
    pub fn detector_at(&self, board: usize, channel: usize) -> Option<i32> {
        self.reverse.get(&ChannelAddr { board, channel }).copied()
    }

    /// Detector numbers in insertion order.
    pub fn detectors(&self) -> &[i32] {
        &self.order
    }

    /// Number of mapped detectors.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Remove every mapping.
    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_resolve() {
        let mut map = DetectorMap::new();
        map.insert(7, 0, 0).unwrap();
        map.insert(3, 1, 0).unwrap();
        assert_eq!(map.resolve(3).unwrap(), ChannelAddr { board: 1, channel: 0 });
        assert_eq!(map.detector_at(0, 0), Some(7));
        assert_eq!(map.detectors(), &[7, 3]);
    }

    #[test]
    fn test_bijection_enforced() {
        let mut map = DetectorMap::new();
        map.insert(0, 0, 0).unwrap();
        assert!(map.insert(0, 1, 0).is_err());
        assert!(map.insert(1, 0, 0).is_err());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_unknown_detector() {
        let map = DetectorMap::new();
        assert!(matches!(
            map.resolve(42),
            Err(DxpError::UnknownDetector { detector: 42 })
        ));
    }
}
