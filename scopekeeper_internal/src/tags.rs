use std::collections::BTreeMap;

/// Outstanding tags for commands the proxy itself sent to the host.
///
/// Tags start at a fixed base (1 unless [`TagTable::starting_at`] says otherwise) and the
/// lowest free one is always handed out, so a quiet session keeps reusing the same numbers.
/// Tag 0 is never allocated.
#[derive(Debug)]
pub struct TagTable<T> {
    entries: BTreeMap<u32, T>,
    first: u32,
}

impl<T> Default for TagTable<T> {
    fn default() -> Self {
        TagTable {
            entries: BTreeMap::new(),
            first: 1,
        }
    }
}

impl<T> TagTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table whose tags start at `first`, keeping the range below it free for other senders.
    pub fn starting_at(first: u32) -> Self {
        TagTable {
            entries: BTreeMap::new(),
            first: first.max(1),
        }
    }

    /// Reserves the lowest free tag for `value`.
    pub fn alloc(&mut self, value: T) -> u32 {
        let mut tag = self.first;
        for &used in self.entries.keys() {
            if used != tag {
                break;
            }
            tag += 1;
        }
        self.entries.insert(tag, value);
        tag
    }

    /// Releases `tag`, returning what it was reserved for.
    pub fn take(&mut self, tag: u32) -> Option<T> {
        self.entries.remove(&tag)
    }

    pub fn contains(&self, tag: u32) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
