use std::fmt;

/// A virtual offset into a block-compressed stream.
///
/// Packs the compressed offset of a block start into the upper 48 bits and
/// the position within that block's decompressed payload into the lower 16
/// bits. Because blocks decompress to at most 65536 bytes the within-block
/// part always fits, and the packed integers order exactly like stream
/// positions, so virtual offsets can be compared and stored directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    /// Builds a virtual offset from a compressed block start and a position
    /// within the decompressed payload of that block.
    #[must_use]
    pub fn new(coffset: u64, uoffset: u16) -> Self {
        Self((coffset << 16) | u64::from(uoffset))
    }

    /// Reinterprets a raw packed value as a virtual offset.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw packed value.
    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The compressed offset of the block this position lies in.
    #[must_use]
    pub fn coffset(&self) -> u64 {
        self.0 >> 16
    }

    /// The position within the block's decompressed payload.
    #[must_use]
    pub fn uoffset(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Display for VirtualOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.coffset(), self.uoffset())
    }
}

impl From<VirtualOffset> for u64 {
    fn from(v: VirtualOffset) -> u64 {
        v.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let v = VirtualOffset::new(123_456, 789);
        assert_eq!(v.coffset(), 123_456);
        assert_eq!(v.uoffset(), 789);
        assert_eq!(v.raw(), (123_456 << 16) | 789);
    }

    #[test]
    fn test_ordering_matches_stream_order() {
        let a = VirtualOffset::new(100, 65535);
        let b = VirtualOffset::new(101, 0);
        let c = VirtualOffset::new(101, 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_zero_is_stream_start() {
        let v = VirtualOffset::default();
        assert_eq!(v.coffset(), 0);
        assert_eq!(v.uoffset(), 0);
        assert_eq!(v, VirtualOffset::new(0, 0));
    }

    #[test]
    fn test_display() {
        let v = VirtualOffset::new(42, 7);
        assert_eq!(format!("{v}"), "42:7");
    }
}
