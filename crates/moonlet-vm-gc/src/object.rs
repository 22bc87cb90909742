//! GC object layout

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// GC object header, embedded at the start of every heap cell.
pub struct GcHeader {
    /// Mark bits for tri-color marking (White=0, Gray=1, Black=2)
    mark: AtomicU8,
    /// Object type tag
    tag: u8,
    /// Whether a post-mortem callback is armed on this object.
    /// Armed objects are reported to the registered handler before the
    /// sweep frees them.
    post_mortem: AtomicBool,
}

/// Mark color for tri-color marking
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkColor {
    /// Not yet visited
    White = 0,
    /// In worklist
    Gray = 1,
    /// Fully scanned
    Black = 2,
}

impl GcHeader {
    /// Create new header
    pub const fn new(tag: u8) -> Self {
        Self {
            mark: AtomicU8::new(MarkColor::White as u8),
            tag,
            post_mortem: AtomicBool::new(false),
        }
    }

    /// Get mark color
    #[inline]
    pub fn mark(&self) -> MarkColor {
        match self.mark.load(Ordering::Acquire) {
            1 => MarkColor::Gray,
            2 => MarkColor::Black,
            _ => MarkColor::White,
        }
    }

    /// Set mark color
    #[inline]
    pub fn set_mark(&self, color: MarkColor) {
        self.mark.store(color as u8, Ordering::Release);
    }

    /// Get object tag
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Arm the post-mortem callback on this object.
    ///
    /// The next collection in which the object is unreachable will consult
    /// the heap's [`PostMortemHandler`](crate::heap::PostMortemHandler)
    /// instead of freeing it outright.
    pub fn arm_post_mortem(&self) {
        self.post_mortem.store(true, Ordering::Release);
    }

    /// Disarm the post-mortem callback.
    pub fn disarm_post_mortem(&self) {
        self.post_mortem.store(false, Ordering::Release);
    }

    /// Whether a post-mortem callback is armed.
    pub fn post_mortem_armed(&self) -> bool {
        self.post_mortem.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for GcHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcHeader")
            .field("mark", &self.mark())
            .field("tag", &self.tag)
            .field("post_mortem", &self.post_mortem_armed())
            .finish()
    }
}

/// Object type tags
pub mod tags {
    /// Table object
    pub const TABLE: u8 = 1;
    /// Closure object
    pub const CLOSURE: u8 = 2;
    /// Userdata object
    pub const USERDATA: u8 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_marking() {
        let header = GcHeader::new(tags::TABLE);
        assert_eq!(header.mark(), MarkColor::White);

        header.set_mark(MarkColor::Gray);
        assert_eq!(header.mark(), MarkColor::Gray);

        header.set_mark(MarkColor::Black);
        assert_eq!(header.mark(), MarkColor::Black);
    }

    #[test]
    fn test_post_mortem_arming() {
        let header = GcHeader::new(tags::USERDATA);
        assert!(!header.post_mortem_armed());

        header.arm_post_mortem();
        assert!(header.post_mortem_armed());

        header.disarm_post_mortem();
        assert!(!header.post_mortem_armed());
    }
}
