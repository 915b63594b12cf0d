//! Per-plan scratch memory: bookings made while planning, resolved to
//! offsets once, then handed to the executor as a read-only table.

use std::ops::Range;

use bytemuck::Pod;

use crate::error::{ensure_args, PrimitiveError, PrimitiveResult};

/// Named scratch regions a plan can reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchpadKey {
    /// Source repacked to unit stride.
    ConvRtusSpace,
    /// Bias zero-padded up to the channel block.
    ConvPaddedBias,
    /// f32 accumulators for bf16 destinations.
    ConvStoreWorkspace,
    /// Per-thread partial weight gradients.
    ConvWeiReduction,
    /// Per-thread partial bias gradients.
    ConvBiasReduction,
    /// bf16 source transposed for the vnni reduction.
    ConvTrSrc,
    /// bf16 diff_dst transposed for the vnni reduction.
    ConvTrDiffDst,
    /// Intermediate rows shared by a fused 1x1 + depthwise pass.
    FusionInoutBuffer,
}

/// Namespace for bookings made on behalf of a nested primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyPrefix {
    #[default]
    None,
    Fusion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BookingKey {
    pub prefix: KeyPrefix,
    pub key: ScratchpadKey,
}

impl From<ScratchpadKey> for BookingKey {
    fn from(key: ScratchpadKey) -> Self {
        Self {
            prefix: KeyPrefix::None,
            key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub key: BookingKey,
    pub nelems: usize,
    pub elem_size: usize,
    /// Extra alignment on top of the layout-wide alignment, if any.
    pub alignment: usize,
}

impl Booking {
    pub fn bytes(&self) -> Option<usize> {
        self.nelems.checked_mul(self.elem_size)
    }
}

/// Ordered, write-once set of bookings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScratchpadRegistry {
    bookings: Vec<Booking>,
}

impl ScratchpadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registrar(&mut self) -> Registrar<'_> {
        Registrar {
            registry: self,
            prefix: KeyPrefix::None,
        }
    }

    pub fn bookings(&self) -> &[Booking] {
        &self.bookings
    }

    pub fn get(&self, key: impl Into<BookingKey>) -> Option<&Booking> {
        let key = key.into();
        self.bookings.iter().find(|b| b.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    /// Resolves every booking to an aligned byte range.
    ///
    /// Ranges are laid out in booking order and never overlap. Fails with
    /// `OutOfMemory` on arithmetic overflow or when the total exceeds
    /// `limit`, and with `InvalidArguments` when an alignment is not a
    /// power of two.
    pub fn finalize(&self, alignment: usize, limit: Option<usize>) -> PrimitiveResult<ScratchpadLayout> {
        let alignment = alignment.max(1);
        ensure_args!(
            alignment.is_power_of_two(),
            "scratchpad alignment must be a power of two, got {}",
            alignment
        );
        let oom = |requested| PrimitiveError::OutOfMemory {
            requested,
            limit: limit.unwrap_or(usize::MAX),
        };

        let mut entries = Vec::with_capacity(self.bookings.len());
        let mut offset = 0usize;
        for booking in &self.bookings {
            let align = alignment.max(booking.alignment);
            ensure_args!(
                align.is_power_of_two(),
                "alignment of {:?} must be a power of two, got {}",
                booking.key,
                align
            );
            let start = align_up(offset, align).ok_or_else(|| oom(usize::MAX))?;
            let end = booking
                .bytes()
                .and_then(|bytes| start.checked_add(bytes))
                .ok_or_else(|| oom(usize::MAX))?;
            entries.push((booking.key, start..end));
            offset = end;
        }
        let size = align_up(offset, alignment).ok_or_else(|| oom(usize::MAX))?;
        if let Some(limit) = limit {
            if size > limit {
                return Err(oom(size));
            }
        }
        Ok(ScratchpadLayout {
            entries,
            size,
            alignment,
        })
    }
}

fn align_up(v: usize, align: usize) -> Option<usize> {
    Some(v.checked_add(align - 1)? / align * align)
}

/// Booking handle, optionally scoped under a key prefix.
pub struct Registrar<'a> {
    registry: &'a mut ScratchpadRegistry,
    prefix: KeyPrefix,
}

impl Registrar<'_> {
    /// Reserves `nelems` elements of `elem_size` bytes under `key`.
    ///
    /// Zero-sized bookings are ignored. Booking the same key twice is an
    /// error.
    pub fn book(&mut self, key: ScratchpadKey, nelems: usize, elem_size: usize) -> PrimitiveResult<()> {
        self.book_aligned(key, nelems, elem_size, 0)
    }

    pub fn book_aligned(
        &mut self,
        key: ScratchpadKey,
        nelems: usize,
        elem_size: usize,
        alignment: usize,
    ) -> PrimitiveResult<()> {
        if nelems == 0 || elem_size == 0 {
            return Ok(());
        }
        let key = BookingKey {
            prefix: self.prefix,
            key,
        };
        if self.registry.bookings.iter().any(|b| b.key == key) {
            return Err(PrimitiveError::invalid(format!(
                "scratchpad key {:?} booked twice",
                key
            )));
        }
        self.registry.bookings.push(Booking {
            key,
            nelems,
            elem_size,
            alignment,
        });
        Ok(())
    }

    /// A registrar that books under `prefix` into the same registry.
    pub fn prefixed(&mut self, prefix: KeyPrefix) -> Registrar<'_> {
        Registrar {
            registry: &mut *self.registry,
            prefix,
        }
    }
}

/// Finalized offsets of a plan's scratchpad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchpadLayout {
    entries: Vec<(BookingKey, Range<usize>)>,
    size: usize,
    alignment: usize,
}

impl ScratchpadLayout {
    /// Total bytes, including alignment padding.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn range(&self, key: impl Into<BookingKey>) -> Option<Range<usize>> {
        let key = key.into();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, r)| r.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = (BookingKey, Range<usize>)> + '_ {
        self.entries.iter().cloned()
    }
}

/// Aligned scratch arena backing one [`ScratchpadLayout`].
pub struct ScratchpadBuffer {
    layout: ScratchpadLayout,
    data: Vec<u8>,
    base: usize,
}

impl ScratchpadBuffer {
    pub fn new(layout: &ScratchpadLayout) -> Self {
        let data = vec![0u8; layout.size + layout.alignment];
        let base = data.as_ptr().align_offset(layout.alignment).min(layout.alignment);
        Self {
            layout: layout.clone(),
            data,
            base,
        }
    }

    pub fn layout(&self) -> &ScratchpadLayout {
        &self.layout
    }

    pub fn bytes_mut(&mut self, key: impl Into<BookingKey>) -> Option<&mut [u8]> {
        let range = self.layout.range(key)?;
        self.data.get_mut(self.base + range.start..self.base + range.end)
    }

    /// Typed view of a booking. `None` if the key was not booked or the
    /// region does not fit a whole number of `T`.
    pub fn get_mut<T: Pod>(&mut self, key: impl Into<BookingKey>) -> Option<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.bytes_mut(key)?).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;

    #[test]
    fn bookings_do_not_overlap() {
        let mut registry = ScratchpadRegistry::new();
        let mut r = registry.registrar();
        r.book(ScratchpadKey::ConvPaddedBias, 17, 4).unwrap();
        r.book(ScratchpadKey::ConvRtusSpace, 100, 2).unwrap();
        r.prefixed(KeyPrefix::Fusion)
            .book(ScratchpadKey::ConvPaddedBias, 3, 4)
            .unwrap();
        let layout = registry.finalize(64, None).unwrap();

        let ranges: Vec<_> = layout.iter().map(|(_, r)| r).collect();
        assert_eq!(ranges.len(), 3);
        for (i, a) in ranges.iter().enumerate() {
            assert_eq!(a.start % 64, 0);
            for b in &ranges[i + 1..] {
                assert!(a.end <= b.start || b.end <= a.start, "{a:?} overlaps {b:?}");
            }
        }
        assert!(layout.size() >= ranges.last().unwrap().end);
        assert_eq!(layout.size() % 64, 0);
    }

    #[test]
    fn zero_size_booking_is_ignored() {
        let mut registry = ScratchpadRegistry::new();
        registry.registrar().book(ScratchpadKey::ConvTrSrc, 0, 2).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.finalize(64, None).unwrap().size(), 0);
    }

    #[test]
    fn double_booking_is_rejected() {
        let mut registry = ScratchpadRegistry::new();
        let mut r = registry.registrar();
        r.book(ScratchpadKey::ConvTrSrc, 8, 2).unwrap();
        let err = r.book(ScratchpadKey::ConvTrSrc, 8, 2).unwrap_err();
        assert_eq!(err.kind(), Status::InvalidArguments);
        // same key under another prefix is a different booking
        r.prefixed(KeyPrefix::Fusion)
            .book(ScratchpadKey::ConvTrSrc, 8, 2)
            .unwrap();
    }

    #[test]
    fn limit_is_enforced() {
        let mut registry = ScratchpadRegistry::new();
        registry
            .registrar()
            .book(ScratchpadKey::ConvStoreWorkspace, 1024, 4)
            .unwrap();
        let err = registry.finalize(64, Some(1000)).unwrap_err();
        assert_eq!(
            err,
            PrimitiveError::OutOfMemory {
                requested: 4096,
                limit: 1000
            }
        );
        assert!(registry.finalize(64, Some(4096)).is_ok());
    }

    #[test]
    fn overflow_is_out_of_memory() {
        let mut registry = ScratchpadRegistry::new();
        registry
            .registrar()
            .book(ScratchpadKey::ConvStoreWorkspace, usize::MAX / 2, 4)
            .unwrap();
        let err = registry.finalize(64, None).unwrap_err();
        assert_eq!(err.kind(), Status::OutOfMemory);
    }

    #[test]
    fn non_power_of_two_alignment_is_rejected() {
        let mut registry = ScratchpadRegistry::new();
        let mut r = registry.registrar();
        r.book(ScratchpadKey::ConvPaddedBias, 5, 4).unwrap();
        r.book_aligned(ScratchpadKey::ConvRtusSpace, 7, 2, 24).unwrap();

        let err = registry.finalize(48, None).unwrap_err();
        assert_eq!(err.kind(), Status::InvalidArguments);
        // a per-booking alignment is checked too
        let err = registry.finalize(16, None).unwrap_err();
        assert_eq!(err.kind(), Status::InvalidArguments);
        // zero falls back to byte alignment
        let mut registry = ScratchpadRegistry::new();
        registry.registrar().book(ScratchpadKey::ConvTrSrc, 3, 2).unwrap();
        assert_eq!(registry.finalize(0, None).unwrap().alignment(), 1);
    }

    #[test]
    fn buffer_hands_out_aligned_typed_slices() {
        let mut registry = ScratchpadRegistry::new();
        let mut r = registry.registrar();
        r.book(ScratchpadKey::ConvPaddedBias, 5, 4).unwrap();
        r.book(ScratchpadKey::ConvRtusSpace, 7, 2).unwrap();
        let layout = registry.finalize(64, None).unwrap();
        let mut buffer = ScratchpadBuffer::new(&layout);

        let bias = buffer.get_mut::<f32>(ScratchpadKey::ConvPaddedBias).unwrap();
        assert_eq!(bias.len(), 5);
        assert_eq!(bias.as_ptr() as usize % 64, 0);
        bias.fill(1.5);

        let rtus = buffer.get_mut::<u16>(ScratchpadKey::ConvRtusSpace).unwrap();
        assert_eq!(rtus.len(), 7);
        assert!(rtus.iter().all(|&v| v == 0));

        assert!(buffer.bytes_mut(ScratchpadKey::ConvTrSrc).is_none());
    }
}
