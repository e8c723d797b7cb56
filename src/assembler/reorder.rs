//! Restores page order for results that complete out of order.

use std::collections::BTreeMap;
use std::ops::Range;

use tracing::debug;

use crate::raster::PageImage;

/// Holds completed pages until every earlier page of the chunk has arrived.
///
/// A slot of `None` marks a page that failed; it still advances the cursor.
#[derive(Debug)]
pub struct ReorderBuffer {
    next: usize,
    end: usize,
    pending: BTreeMap<usize, Option<PageImage>>,
}

impl ReorderBuffer {
    #[must_use]
    pub fn new(range: Range<usize>) -> Self {
        Self {
            next: range.start,
            end: range.end,
            pending: BTreeMap::new(),
        }
    }

    /// Accepts the outcome of one page. Indices outside the remaining range
    /// or already delivered are ignored.
    pub fn insert(&mut self, index: usize, image: Option<PageImage>) {
        if index < self.next || index >= self.end {
            debug!(index, next = self.next, "ignoring out-of-range page");
            return;
        }
        self.pending.entry(index).or_insert(image);
    }

    /// Pops the next page if it is the one the cursor waits for.
    pub fn pop_ready(&mut self) -> Option<(usize, Option<PageImage>)> {
        let slot = self.pending.remove(&self.next)?;
        let index = self.next;
        self.next += 1;
        Some((index, slot))
    }

    /// Drains every page that is now in order.
    pub fn drain_ready(&mut self) -> Vec<(usize, Option<PageImage>)> {
        std::iter::from_fn(|| self.pop_ready()).collect()
    }

    /// Marks every page that never arrived as failed and returns their
    /// indices. Afterwards [`drain_ready`](Self::drain_ready) empties the buffer.
    pub fn close_gaps(&mut self) -> Vec<usize> {
        let missing: Vec<usize> = (self.next..self.end)
            .filter(|index| !self.pending.contains_key(index))
            .collect();
        for &index in &missing {
            self.pending.insert(index, None);
        }
        missing
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.next >= self.end
    }

    /// Pages buffered while waiting for a gap to fill.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::raster::ImageKind;

    fn page(index: usize) -> Option<PageImage> {
        Some(PageImage::encoded(index, ImageKind::Png, vec![0; 4]))
    }

    #[test]
    fn test_releases_pages_in_index_order() {
        let mut buffer = ReorderBuffer::new(10..14);
        buffer.insert(12, page(12));
        buffer.insert(11, page(11));
        assert!(buffer.pop_ready().is_none());
        assert_eq!(buffer.buffered(), 2);

        buffer.insert(10, page(10));
        let order: Vec<usize> = buffer.drain_ready().into_iter().map(|(i, _)| i).collect();
        assert_eq!(order, vec![10, 11, 12]);
        assert!(!buffer.is_complete());

        buffer.insert(13, None);
        let (index, slot) = buffer.pop_ready().unwrap();
        assert_eq!(index, 13);
        assert!(slot.is_none());
        assert!(buffer.is_complete());
    }

    #[test]
    fn test_closing_gaps_releases_pages_held_behind_them() {
        let mut buffer = ReorderBuffer::new(0..5);
        buffer.insert(0, page(0));
        buffer.insert(2, page(2));
        buffer.insert(4, None);
        assert_eq!(buffer.drain_ready().len(), 1);

        assert_eq!(buffer.close_gaps(), vec![1, 3]);
        let released: Vec<(usize, bool)> = buffer
            .drain_ready()
            .into_iter()
            .map(|(i, slot)| (i, slot.is_some()))
            .collect();
        assert_eq!(released, vec![(1, false), (2, true), (3, false), (4, false)]);
        assert!(buffer.is_complete());
        assert!(buffer.close_gaps().is_empty());
    }

    #[test]
    fn test_ignores_foreign_and_repeated_indices() {
        let mut buffer = ReorderBuffer::new(0..2);
        buffer.insert(5, page(5));
        buffer.insert(0, page(0));
        assert!(buffer.pop_ready().is_some());
        buffer.insert(0, page(0));
        assert_eq!(buffer.buffered(), 0);
    }
}
