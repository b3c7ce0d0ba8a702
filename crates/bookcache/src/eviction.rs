//! Eviction policy interface and the LRU list
//!
//! The cache reports each entry's lifecycle (insert, touch, remove) to an
//! [`Evictor`] by bookmark and asks it for victims when over budget.
//!
//! [`Lru`] keeps a circular doubly-linked list threaded through a
//! bookmark-indexed link table. `head` is the least recently used entry and
//! `head.prev` the most recently used one, so no sentinel node is needed.
//!
//! The links are not stored inside the book's entries. `Lru` owns them in its
//! own table indexed by bookmark, so a reader holding only the cache's shared
//! lock can still splice the list under the evictor mutex.

use crate::book::{Bookmark, NO_BOOKMARK};
use crate::error::{Error, Result};

/// Item-lifecycle interface between the cache and its eviction policy
///
/// All methods must run in O(1). The cache serialises calls through one
/// mutex per evictor.
pub trait Evictor: Send {
    /// A new entry was stored at `bookmark`
    fn on_insert(&mut self, bookmark: Bookmark);

    /// The entry at `bookmark` was read or overwritten
    fn on_touch(&mut self, bookmark: Bookmark);

    /// The entry at `bookmark` is being removed by the cache
    fn on_remove(&mut self, bookmark: Bookmark);

    /// Unlink and return the next entry to evict
    fn evict(&mut self) -> Option<Bookmark>;

    /// Check whether `bookmark` is currently tracked
    fn contains(&self, bookmark: Bookmark) -> bool;

    /// Number of tracked entries
    fn len(&self) -> usize;

    /// Check if nothing is tracked
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry
    fn clear(&mut self);

    /// Validate internal structure (diagnostics only)
    fn check_invariants(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    next: Bookmark,
    prev: Bookmark,
}

const UNLINKED: Link = Link {
    next: NO_BOOKMARK,
    prev: NO_BOOKMARK,
};

/// Least-recently-used eviction list
#[derive(Debug)]
pub struct Lru {
    links: Vec<Link>,
    head: Bookmark,
    len: usize,
}

impl Default for Lru {
    fn default() -> Self {
        Self::new()
    }
}

impl Lru {
    /// Create an empty list
    pub fn new() -> Self {
        Self {
            links: Vec::new(),
            head: NO_BOOKMARK,
            len: 0,
        }
    }

    /// Least recently used bookmark (next victim)
    pub fn lru(&self) -> Option<Bookmark> {
        (self.head != NO_BOOKMARK).then_some(self.head)
    }

    /// Most recently used bookmark
    pub fn mru(&self) -> Option<Bookmark> {
        self.lru().map(|head| self.link(head).prev)
    }

    /// Bookmarks from least to most recently used
    pub fn iter(&self) -> impl Iterator<Item = Bookmark> + '_ {
        let mut cursor = self.head;
        let mut remaining = self.len;
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let bookmark = cursor;
            cursor = self.link(bookmark).next;
            remaining -= 1;
            Some(bookmark)
        })
    }

    #[inline]
    fn link(&self, bookmark: Bookmark) -> Link {
        self.links[bookmark as usize]
    }

    #[inline]
    fn link_mut(&mut self, bookmark: Bookmark) -> &mut Link {
        &mut self.links[bookmark as usize]
    }

    /// Link `bookmark` in as most recently used
    fn splice_last(&mut self, bookmark: Bookmark) {
        if self.head == NO_BOOKMARK {
            self.head = bookmark;
            *self.link_mut(bookmark) = Link {
                next: bookmark,
                prev: bookmark,
            };
            return;
        }
        let head = self.head;
        let last = self.link(head).prev;
        self.link_mut(last).next = bookmark;
        self.link_mut(head).prev = bookmark;
        *self.link_mut(bookmark) = Link {
            next: head,
            prev: last,
        };
    }

    /// Join the neighbours of `bookmark`; `head` and `len` are left alone
    fn unsplice(&mut self, bookmark: Bookmark) {
        let Link { next, prev } = self.link(bookmark);
        self.link_mut(prev).next = next;
        self.link_mut(next).prev = prev;
    }
}

impl Evictor for Lru {
    fn on_insert(&mut self, bookmark: Bookmark) {
        let i = bookmark as usize;
        if i >= self.links.len() {
            self.links.resize(i + 1, UNLINKED);
        }
        assert!(
            self.link(bookmark) == UNLINKED,
            "bookmark {} inserted while still linked",
            bookmark
        );
        self.splice_last(bookmark);
        self.len += 1;
    }

    fn on_touch(&mut self, bookmark: Bookmark) {
        assert!(
            self.contains(bookmark),
            "touch of unlinked bookmark {}",
            bookmark
        );
        let head = self.head;
        if bookmark == self.link(head).prev {
            return;
        }
        if bookmark == head {
            // Rotating the cycle makes the old head the most recent
            self.head = self.link(head).next;
            return;
        }
        self.unsplice(bookmark);
        self.splice_last(bookmark);
    }

    fn on_remove(&mut self, bookmark: Bookmark) {
        assert!(
            self.contains(bookmark),
            "removal of unlinked bookmark {}",
            bookmark
        );
        let next = self.link(bookmark).next;
        if self.head == bookmark {
            self.head = if next == bookmark { NO_BOOKMARK } else { next };
        }
        if next != bookmark {
            self.unsplice(bookmark);
        }
        *self.link_mut(bookmark) = UNLINKED;
        self.len -= 1;
    }

    fn evict(&mut self) -> Option<Bookmark> {
        let victim = self.lru()?;
        self.on_remove(victim);
        Some(victim)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn clear(&mut self) {
        self.links.clear();
        self.head = NO_BOOKMARK;
        self.len = 0;
    }

    fn contains(&self, bookmark: Bookmark) -> bool {
        self.links
            .get(bookmark as usize)
            .is_some_and(|link| *link != UNLINKED)
    }

    /// Walk the cycle and verify both directions agree with `len`
    fn check_invariants(&self) -> Result<()> {
        if self.head == NO_BOOKMARK {
            if self.len != 0 {
                return Err(Error::Invariant(format!(
                    "empty list with length {}",
                    self.len
                )));
            }
            return Ok(());
        }

        let mut last = NO_BOOKMARK;
        for (step, bookmark) in self.iter().enumerate() {
            let link = self.link(bookmark);
            if link == UNLINKED {
                return Err(Error::Invariant(format!(
                    "unlinked bookmark {} reached at step {}",
                    bookmark, step
                )));
            }
            if self.link(link.next).prev != bookmark {
                return Err(Error::Invariant(format!(
                    "{}.next = {} but {}.prev = {}",
                    bookmark,
                    link.next,
                    link.next,
                    self.link(link.next).prev
                )));
            }
            last = bookmark;
        }
        if self.link(last).next != self.head {
            return Err(Error::Invariant(format!(
                "list of length {} does not cycle back to head {}",
                self.len, self.head
            )));
        }
        if self.mru() != Some(last) {
            return Err(Error::Invariant(format!(
                "walk ends at {} but head.prev is {:?}",
                last,
                self.mru()
            )));
        }

        let linked = self.links.iter().filter(|link| **link != UNLINKED).count();
        if linked != self.len {
            return Err(Error::Invariant(format!(
                "{} linked bookmarks but length {}",
                linked, self.len
            )));
        }
        Ok(())
    }
}
