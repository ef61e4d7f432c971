//! Versioned mark bitmap for one block of cells.
//!
//! Each bitmap is stamped with the [`MarkingVersion`] its bits belong to.
//! When a cycle with a newer version first marks into the block, the bits
//! are cleared lazily under a lock (`about_to_mark`). Bits from an older
//! version therefore always read as unmarked, and nothing has to walk the
//! whole heap between cycles.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::heap::MarkingVersion;

/// A block-level bitmap with one mark bit per cell slot.
///
/// # Example
///
/// ```
/// use tricolor::gc::mark::MarkBitmap;
/// use tricolor::heap::MarkingVersion;
///
/// let bitmap = MarkBitmap::new(512);
/// let v1 = MarkingVersion::INITIAL;
///
/// assert!(!bitmap.test_and_set(v1, 7));
/// assert!(bitmap.test_and_set(v1, 7));
/// assert!(bitmap.is_marked(v1, 7));
///
/// // The next cycle sees a clean block.
/// assert!(!bitmap.is_marked(v1.next(), 7));
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    /// Bitmap storage, one bit per cell slot.
    bitmap: Vec<AtomicU64>,
    /// Number of cell slots in the block.
    capacity: usize,
    /// Number of slots marked in the current version.
    marked_count: AtomicUsize,
    /// Version the bits belong to.
    version: AtomicU32,
    /// Serializes the lazy clear.
    clear_lock: Mutex<()>,
}

impl MarkBitmap {
    /// Create a bitmap for `capacity` slots, stamped with
    /// [`MarkingVersion::NULL`].
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a multiple of 64.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity % 64 == 0,
            "MarkBitmap capacity must be aligned to 64"
        );
        let words = capacity / 64;
        let mut bitmap = Vec::with_capacity(words);
        for _ in 0..words {
            bitmap.push(AtomicU64::new(0));
        }
        Self {
            bitmap,
            capacity,
            marked_count: AtomicUsize::new(0),
            version: AtomicU32::new(MarkingVersion::NULL.0),
            clear_lock: Mutex::new(()),
        }
    }

    /// Number of cell slots covered.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Version the current bits belong to.
    #[must_use]
    pub fn version(&self) -> MarkingVersion {
        MarkingVersion(self.version.load(Ordering::Acquire))
    }

    /// Number of slots marked in `version`.
    #[must_use]
    pub fn marked_count(&self, version: MarkingVersion) -> usize {
        if self.version() != version {
            return 0;
        }
        self.marked_count.load(Ordering::Relaxed)
    }

    /// Make sure the bits belong to `version`, clearing stale ones.
    ///
    /// Cheap when the block was already prepared for `version`.
    pub fn about_to_mark(&self, version: MarkingVersion) {
        if self.version() == version {
            return;
        }
        let _guard = self.clear_lock.lock();
        if self.version() == version {
            return;
        }
        for word in &self.bitmap {
            word.store(0, Ordering::Relaxed);
        }
        self.marked_count.store(0, Ordering::Relaxed);
        self.version.store(version.0, Ordering::Release);
    }

    /// Atomically set the bit for `slot` in `version`.
    ///
    /// Returns `true` if the bit was already set. Only one of any number of
    /// racing callers gets `false`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of bounds.
    pub fn test_and_set(&self, version: MarkingVersion, slot: usize) -> bool {
        self.about_to_mark(version);
        let mask = 1u64 << (slot % 64);
        let prev = self.bitmap[slot / 64].fetch_or(mask, Ordering::AcqRel);
        if prev & mask != 0 {
            return true;
        }
        self.marked_count.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Whether `slot` is marked in `version`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of bounds.
    #[must_use]
    pub fn is_marked(&self, version: MarkingVersion, slot: usize) -> bool {
        if self.version() != version {
            return false;
        }
        (self.bitmap[slot / 64].load(Ordering::Acquire) >> (slot % 64)) & 1 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::MarkBitmap;
    use crate::heap::MarkingVersion;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mark_bitmap_concurrent_mark() {
        let bitmap = Arc::new(MarkBitmap::new(512));
        let version = MarkingVersion::INITIAL;
        let mut handles = Vec::new();

        for i in 0..4 {
            let bitmap = Arc::clone(&bitmap);
            handles.push(thread::spawn(move || {
                for j in 0..128 {
                    bitmap.test_and_set(version, i * 128 + j);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(bitmap.marked_count(version), 512);
    }

    #[test]
    fn test_mark_bitmap_single_winner() {
        let bitmap = Arc::new(MarkBitmap::new(64));
        let version = MarkingVersion::INITIAL;
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bitmap = Arc::clone(&bitmap);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if !bitmap.test_and_set(version, 5) {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_mark_bitmap_new() {
        let bitmap = MarkBitmap::new(512);
        assert_eq!(bitmap.capacity(), 512);
        assert_eq!(bitmap.version(), MarkingVersion::NULL);
        assert_eq!(bitmap.marked_count(MarkingVersion::NULL), 0);
    }

    #[test]
    fn test_stale_version_reads_unmarked() {
        let bitmap = MarkBitmap::new(128);
        let v1 = MarkingVersion::INITIAL;
        let v2 = v1.next();

        assert!(!bitmap.test_and_set(v1, 0));
        assert!(!bitmap.test_and_set(v1, 100));
        assert_eq!(bitmap.marked_count(v1), 2);

        assert!(!bitmap.is_marked(v2, 0));
        assert_eq!(bitmap.marked_count(v2), 0);

        assert!(!bitmap.test_and_set(v2, 0));
        assert_eq!(bitmap.version(), v2);
        assert!(!bitmap.is_marked(v2, 100));
        assert_eq!(bitmap.marked_count(v2), 1);
    }

    #[test]
    fn test_mark_bitmap_idempotent() {
        let bitmap = MarkBitmap::new(512);
        let version = MarkingVersion::INITIAL;

        assert!(!bitmap.test_and_set(version, 0));
        assert!(bitmap.test_and_set(version, 0));
        assert!(bitmap.test_and_set(version, 0));

        assert_eq!(bitmap.marked_count(version), 1);
    }

    #[test]
    #[should_panic(expected = "aligned to 64")]
    fn test_unaligned_capacity_is_rejected() {
        let _ = MarkBitmap::new(100);
    }
}
