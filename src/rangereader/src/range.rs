// Copyright 2025 Tileverse
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// A half-open interval `[offset, offset + length)` over a source's bytes.
///
/// Ranges order by `offset` first and `length` second, so sorted range sets
/// enumerate a source front to back. The caches use ranges as keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    offset: u64,
    length: u32,
}

impl ByteRange {
    /// Creates a range covering `[offset, offset + length)`.
    pub fn new(offset: u64, length: u32) -> Self {
        Self { offset, length }
    }

    /// The first byte covered by this range.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The number of bytes covered by this range.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// One past the last byte covered by this range.
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }

    /// Returns `true` if the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns `true` if `other` is fully contained in this range.
    pub fn contains(&self, other: &ByteRange) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let range = ByteRange::new(1000, 500);
        assert_eq!(range.offset(), 1000);
        assert_eq!(range.length(), 500);
        assert_eq!(range.end(), 1500);
        assert!(!range.is_empty());
        assert!(ByteRange::new(1000, 0).is_empty());
    }

    #[test]
    fn order_by_offset_then_length() {
        let mut ranges = vec![
            ByteRange::new(100, 10),
            ByteRange::new(0, 20),
            ByteRange::new(100, 5),
            ByteRange::new(0, 10),
        ];
        ranges.sort();
        assert_eq!(
            ranges,
            vec![
                ByteRange::new(0, 10),
                ByteRange::new(0, 20),
                ByteRange::new(100, 5),
                ByteRange::new(100, 10),
            ]
        );
    }

    #[test]
    fn containment() {
        let outer = ByteRange::new(1024, 1024);
        assert!(outer.contains(&ByteRange::new(1024, 1024)));
        assert!(outer.contains(&ByteRange::new(1500, 100)));
        assert!(outer.contains(&ByteRange::new(2048, 0)));
        assert!(!outer.contains(&ByteRange::new(1023, 10)));
        assert!(!outer.contains(&ByteRange::new(2000, 100)));
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", ByteRange::new(1000, 500)), "[1000, 1500)");
    }
}
