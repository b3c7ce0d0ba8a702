//! Slab book: fixed-capacity entry storage addressed by bookmark
//!
//! Unused pages hold the bookmark of the next unused page, so the free list
//! threads through the slab itself. `first_unused` is the free-list head and
//! `pages.len()` is the high-water mark of pages ever handed out.

use crate::error::{Error, Result};

/// Index of a page in the book; stable for the lifetime of its entry
pub type Bookmark = u32;

/// Marks the end of the free list and an empty eviction list
pub const NO_BOOKMARK: Bookmark = Bookmark::MAX;

/// One cached item
#[derive(Debug)]
pub(crate) struct Entry {
    /// Slot of this entry in the hash index
    pub(crate) position: usize,
    key_len: usize,
    /// Key bytes immediately followed by value bytes
    data: Vec<u8>,
}

impl Entry {
    pub(crate) fn new(position: usize, key: &[u8], value: &[u8]) -> Self {
        let mut data = Vec::with_capacity(key.len() + value.len());
        data.extend_from_slice(key);
        data.extend_from_slice(value);
        Self {
            position,
            key_len: key.len(),
            data,
        }
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.data[..self.key_len]
    }

    pub(crate) fn value(&self) -> &[u8] {
        &self.data[self.key_len..]
    }

    /// Bytes charged against the memory budget (key + value)
    pub(crate) fn size(&self) -> usize {
        self.data.len()
    }

    /// Swap in a new value, reusing the existing allocation when it fits
    pub(crate) fn replace_value(&mut self, value: &[u8]) {
        self.data.truncate(self.key_len);
        self.data.extend_from_slice(value);
    }
}

#[derive(Debug)]
enum Page {
    Unused(Bookmark),
    Used(Entry),
}

/// Slab of entry pages with O(1) allocate/free
#[derive(Debug)]
pub(crate) struct Book {
    pages: Vec<Page>,
    capacity: usize,
    first_unused: Bookmark,
    live: usize,
}

impl Book {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(
            capacity < NO_BOOKMARK as usize,
            "book capacity {} exceeds bookmark range",
            capacity
        );
        Self {
            pages: Vec::with_capacity(capacity),
            capacity,
            first_unused: NO_BOOKMARK,
            live: 0,
        }
    }

    /// Store `entry` in a free page, reusing freed pages first
    pub(crate) fn allocate(&mut self, entry: Entry) -> Bookmark {
        self.live += 1;
        if self.first_unused != NO_BOOKMARK {
            let bookmark = self.first_unused;
            let page = &mut self.pages[bookmark as usize];
            match *page {
                Page::Unused(next) => self.first_unused = next,
                Page::Used(_) => panic!("free list head {} is a live page", bookmark),
            }
            *page = Page::Used(entry);
            return bookmark;
        }

        let end = self.pages.len();
        assert!(
            end < self.capacity,
            "book exhausted: {} pages in use with capacity {}",
            end,
            self.capacity
        );
        self.pages.push(Page::Used(entry));
        end as Bookmark
    }

    /// Return the page to the free list, handing back its entry
    pub(crate) fn free(&mut self, bookmark: Bookmark) -> Entry {
        let page = std::mem::replace(
            &mut self.pages[bookmark as usize],
            Page::Unused(self.first_unused),
        );
        match page {
            Page::Used(entry) => {
                self.first_unused = bookmark;
                self.live -= 1;
                entry
            }
            Page::Unused(_) => panic!("double free of bookmark {}", bookmark),
        }
    }

    pub(crate) fn read(&self, bookmark: Bookmark) -> &Entry {
        match &self.pages[bookmark as usize] {
            Page::Used(entry) => entry,
            Page::Unused(_) => panic!("read of unused bookmark {}", bookmark),
        }
    }

    pub(crate) fn read_mut(&mut self, bookmark: Bookmark) -> &mut Entry {
        match &mut self.pages[bookmark as usize] {
            Page::Used(entry) => entry,
            Page::Unused(_) => panic!("write to unused bookmark {}", bookmark),
        }
    }

    /// Raise the page limit; existing pages and bookmarks are untouched
    pub(crate) fn grow(&mut self, capacity: usize) {
        if capacity <= self.capacity {
            return;
        }
        assert!(
            capacity < NO_BOOKMARK as usize,
            "book capacity {} exceeds bookmark range",
            capacity
        );
        self.pages.reserve_exact(capacity - self.pages.len());
        self.capacity = capacity;
    }

    /// Drop every entry; the page limit is kept
    pub(crate) fn clear(&mut self) {
        self.pages.clear();
        self.first_unused = NO_BOOKMARK;
        self.live = 0;
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// High-water mark of pages ever allocated
    #[cfg(test)]
    pub(crate) fn end(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Live entries in bookmark order
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Bookmark, &Entry)> {
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(i, page)| match page {
                Page::Used(entry) => Some((i as Bookmark, entry)),
                Page::Unused(_) => None,
            })
    }

    /// Every page below `end` must be live or on the free list exactly once
    pub(crate) fn check_invariants(&self) -> Result<()> {
        let end = self.pages.len();
        let mut on_free_list = vec![false; end];
        let mut free = 0usize;
        let mut cursor = self.first_unused;
        while cursor != NO_BOOKMARK {
            let i = cursor as usize;
            if i >= end {
                return Err(Error::Invariant(format!(
                    "free list reaches bookmark {} beyond end {}",
                    i, end
                )));
            }
            if on_free_list[i] {
                return Err(Error::Invariant(format!(
                    "free list revisits bookmark {}",
                    i
                )));
            }
            on_free_list[i] = true;
            free += 1;
            cursor = match self.pages[i] {
                Page::Unused(next) => next,
                Page::Used(_) => {
                    return Err(Error::Invariant(format!(
                        "live bookmark {} is on the free list",
                        i
                    )))
                }
            };
        }

        if free + self.live != end {
            return Err(Error::Invariant(format!(
                "{} free + {} live pages != end {}",
                free, self.live, end
            )));
        }
        if end > self.capacity {
            return Err(Error::Invariant(format!(
                "end {} exceeds capacity {}",
                end, self.capacity
            )));
        }
        Ok(())
    }
}
