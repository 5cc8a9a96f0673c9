//! Generation Iterator
//!
//! Sequential iteration over all records of a loaded generation.

use super::reader::GenerationReader;

/// One persisted record, borrowed from the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub tombstone: bool,
}

/// Iterator over a generation in index order
pub struct GenerationIter<'a> {
    reader: &'a GenerationReader,
    next: usize,
}

impl<'a> GenerationIter<'a> {
    pub(super) fn new(reader: &'a GenerationReader) -> Self {
        Self { reader, next: 0 }
    }
}

impl<'a> Iterator for GenerationIter<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.reader.len() {
            return None;
        }
        let i = self.next;
        self.next += 1;
        Some(Record {
            key: self.reader.key_at(i),
            value: self.reader.value_at(i),
            tombstone: self.reader.tombstone_at(i),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.reader.len() - self.next;
        (remaining, Some(remaining))
    }
}
