use std::collections::VecDeque;

use bytes::Bytes;

use super::page::Entry;
use crate::types::Result;

/// Where a chunk read starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seek {
    /// From the smallest entry.
    Start,
    /// From the first entry not less than the target.
    AtOrAfter(Entry),
    /// From the first entry greater than the target.
    After(Entry),
}

/// Something a [`Cursor`] can pull ordered entries from.
pub trait ChunkSource {
    /// Appends up to `limit` ordered entries positioned by `seek` to `out`;
    /// fewer than `limit` means the source is exhausted.
    fn fill(&self, seek: &Seek, limit: usize, out: &mut Vec<Entry>) -> Result<()>;
}

impl<T: ChunkSource + ?Sized> ChunkSource for &T {
    fn fill(&self, seek: &Seek, limit: usize, out: &mut Vec<Entry>) -> Result<()> {
        (**self).fill(seek, limit, out)
    }
}

const CHUNK_LEN: usize = 64;

/// Ordered, restartable cursor.
///
/// The cursor holds no page references between calls: it buffers a chunk of
/// entries and re-seeks after the last returned entry when the chunk runs
/// out, so it never pins a tree version beyond what its source holds.
pub struct Cursor<S> {
    source: S,
    buffer: VecDeque<Entry>,
    last: Option<Entry>,
    start: Seek,
    exhausted: bool,
}

impl<S: ChunkSource> Cursor<S> {
    /// Creates a cursor positioned before the first entry.
    pub fn new(source: S) -> Self {
        Self {
            source,
            buffer: VecDeque::new(),
            last: None,
            start: Seek::Start,
            exhausted: false,
        }
    }

    /// Advances the cursor and returns the next key-value pair, if any.
    pub fn next(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.refill()?;
        }
        Ok(self.buffer.pop_front().map(|entry| {
            self.last = Some(entry.clone());
            (entry.key, entry.value)
        }))
    }

    /// Positions the cursor at the first entry whose key is not less than
    /// `key` and returns it.
    pub fn seek_key(&mut self, key: &[u8]) -> Result<Option<(Bytes, Bytes)>> {
        self.reposition(Seek::AtOrAfter(Entry::lookup(key)));
        self.next()
    }

    /// Positions the cursor before the first entry again.
    pub fn reset(&mut self) {
        self.reposition(Seek::Start);
    }

    /// Drains the remaining entries into a vector.
    pub fn collect_remaining(&mut self) -> Result<Vec<(Bytes, Bytes)>> {
        let mut out = Vec::new();
        while let Some(pair) = self.next()? {
            out.push(pair);
        }
        Ok(out)
    }

    fn reposition(&mut self, seek: Seek) {
        self.buffer.clear();
        self.last = None;
        self.start = seek;
        self.exhausted = false;
    }

    fn refill(&mut self) -> Result<()> {
        let seek = match &self.last {
            Some(entry) => Seek::After(entry.clone()),
            None => self.start.clone(),
        };
        let mut chunk = Vec::with_capacity(CHUNK_LEN);
        self.source.fill(&seek, CHUNK_LEN, &mut chunk)?;
        self.exhausted = chunk.len() < CHUNK_LEN;
        self.buffer.extend(chunk);
        Ok(())
    }
}
