//! A byte FIFO built from a list of chunks.
//!
//! Bytes are appended into the free space of the newest chunk (the tail) and removed from the
//! oldest chunk (the head). Chunks are freed as soon as they are fully drained, and whole chunks
//! are relinked between buffers instead of copied whenever possible.
//!
//! The invariants every operation maintains are checked by [`Buffer::assert_ok`], which runs
//! after each mutation in debug builds:
//! - a chunk's valid region never extends past its allocation;
//! - every chunk except the tail holds at least one byte;
//! - the cached length equals the sum of chunk lengths, and stays below [`BUF_MAX_LEN`].

use std::{
    collections::VecDeque,
    fmt, io,
    time::{Duration, Instant},
};

use ferry_common::constants::KiB;

/// Smallest chunk we allocate.
pub const MIN_CHUNK_ALLOC: usize = 256;
/// Largest chunk we allocate when the caller asked for a capped allocation.
pub const MAX_CHUNK_ALLOC: usize = 64 * KiB as usize;
/// The preferred chunk size of a buffer created with [`Buffer::new`].
pub const DEFAULT_CHUNK_SIZE: usize = 4 * KiB as usize;
/// The maximum number of bytes a single buffer may hold.
pub const BUF_MAX_LEN: usize = i32::MAX as usize - 1;
/// If the tail has less free space than this, reading into it isn't worth a syscall.
pub const MIN_READ_LEN: usize = 8;

/// Returns the smallest power-of-two allocation (at least [`MIN_CHUNK_ALLOC`]) that can hold
/// `target` bytes.
pub fn preferred_chunk_size(target: usize) -> usize {
    assert!(target <= BUF_MAX_LEN, "chunk size request {target} exceeds the buffer limit");
    let mut size = MIN_CHUNK_ALLOC;
    while size < target {
        size <<= 1;
    }
    size
}

/// A contiguous allocation holding a window of buffered bytes.
pub(crate) struct Chunk {
    mem: Box<[u8]>,
    /// Offset of the first valid byte in `mem`.
    off: usize,
    /// Number of valid bytes starting at `off`.
    len: usize,
    /// When the chunk was added to its buffer.
    inserted: Instant,
    /// Optional stream multiplexing tag. Bytes with different tags never share a chunk.
    tag: Option<u32>,
}

impl Chunk {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            mem: vec![0u8; capacity].into_boxed_slice(),
            off: 0,
            len: 0,
            inserted: Instant::now(),
            tag: None,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.mem.len()
    }

    #[inline]
    fn data(&self) -> &[u8] {
        &self.mem[self.off..self.off + self.len]
    }

    #[inline]
    fn spare(&self) -> usize {
        self.mem.len() - self.off - self.len
    }

    #[inline]
    fn spare_mut(&mut self) -> &mut [u8] {
        let end = self.off + self.len;
        &mut self.mem[end..]
    }

    /// Moves the valid bytes to the start of the allocation.
    fn repack(&mut self) {
        if self.off != 0 {
            self.mem.copy_within(self.off..self.off + self.len, 0);
            self.off = 0;
        }
    }

    /// Reallocates the chunk with `capacity` bytes, keeping its data at the front.
    fn grow(&mut self, capacity: usize) {
        debug_assert!(capacity >= self.len);
        let mut mem = vec![0u8; capacity].into_boxed_slice();
        mem[..self.len].copy_from_slice(self.data());
        self.mem = mem;
        self.off = 0;
    }

    /// Consumes `n` bytes from the front of the chunk.
    #[inline]
    fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.off += n;
        self.len -= n;
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("capacity", &self.capacity())
            .field("off", &self.off)
            .field("len", &self.len)
            .field("tag", &self.tag)
            .finish()
    }
}

/// A byte FIFO made of chunks. See the [module documentation](self) for the invariants.
#[derive(Debug)]
pub struct Buffer {
    chunks: VecDeque<Chunk>,
    /// Total number of valid bytes across all chunks.
    len: usize,
    /// Allocation size used for new chunks when no larger size is needed.
    default_chunk_size: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Creates an empty buffer with the default chunk size.
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Creates an empty buffer whose chunks are sized for at least `size` bytes.
    pub fn with_chunk_size(size: usize) -> Self {
        Self { chunks: VecDeque::new(), len: 0, default_chunk_size: preferred_chunk_size(size) }
    }

    /// Returns the number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of chunks currently allocated.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn default_chunk_size(&self) -> usize {
        self.default_chunk_size
    }

    /// Returns the total number of bytes allocated for this buffer's chunks.
    pub fn allocation(&self) -> usize {
        self.chunks.iter().map(Chunk::capacity).sum()
    }

    /// Returns the free space available at the end of the tail chunk.
    pub fn slack(&self) -> usize {
        self.chunks.back().map_or(0, Chunk::spare)
    }

    /// Returns the age of the oldest buffered chunk, if any.
    pub fn oldest_chunk_age(&self, now: Instant) -> Option<Duration> {
        self.chunks.front().map(|c| now.saturating_duration_since(c.inserted))
    }

    /// Returns the stream tag of the head chunk.
    pub fn head_tag(&self) -> Option<u32> {
        self.chunks.front().and_then(|c| c.tag)
    }

    /// Iterates over the valid bytes of every chunk, oldest first.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.chunks.iter().map(Chunk::data).filter(|data| !data.is_empty())
    }

    /// Returns the contiguous bytes at the front of the buffer.
    pub fn first_chunk(&self) -> &[u8] {
        self.chunks.front().map_or(&[], Chunk::data)
    }

    /// Drops all buffered bytes and frees every chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Appends `data` at the end of the buffer, returning the new length.
    pub fn append(&mut self, data: &[u8]) -> usize {
        self.append_inner(data, None)
    }

    /// Appends `data` into chunks reserved for stream `tag`. Bytes of different streams never
    /// share a chunk, so a reader can tell from [`Buffer::head_tag`] which stream the front
    /// bytes belong to.
    pub fn append_tagged(&mut self, data: &[u8], tag: u32) -> usize {
        self.append_inner(data, Some(tag))
    }

    fn append_inner(&mut self, mut data: &[u8], tag: Option<u32>) -> usize {
        self.check_room(data.len());

        while !data.is_empty() {
            let tail_usable = self.chunks.back().is_some_and(|c| c.spare() > 0 && c.tag == tag);
            if !tail_usable {
                self.add_chunk_with_capacity(data.len(), true).tag = tag;
            }

            let tail = self.tail_mut();
            let n = tail.spare().min(data.len());
            tail.spare_mut()[..n].copy_from_slice(&data[..n]);
            tail.len += n;
            self.len += n;
            data = &data[n..];
        }

        self.debug_check();
        self.len
    }

    /// Appends formatted text, like `write!` on a `String`.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) -> usize {
        match args.as_str() {
            Some(s) => self.append(s.as_bytes()),
            None => self.append(args.to_string().as_bytes()),
        }
    }

    /// Copies the first `out.len()` bytes into `out` without consuming them.
    ///
    /// # Panics
    /// If `out` is longer than the buffer.
    pub fn peek(&self, out: &mut [u8]) {
        assert!(out.len() <= self.len, "peek of {} bytes from a {} byte buffer", out.len(), self.len);

        let mut copied = 0;
        for chunk in &self.chunks {
            if copied == out.len() {
                break;
            }
            let n = chunk.len.min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&chunk.data()[..n]);
            copied += n;
        }
    }

    /// Returns a copy of the first `n` bytes without consuming them.
    pub fn peek_vec(&self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        self.peek(&mut out);
        out
    }

    /// Returns a copy of all buffered bytes without consuming them.
    pub fn extract_all(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.data());
        }
        out
    }

    /// Moves the first `out.len()` bytes into `out`.
    pub fn get_bytes(&mut self, out: &mut [u8]) {
        self.peek(out);
        self.drain(out.len());
    }

    /// Removes the first `n` bytes, freeing chunks as they become empty.
    ///
    /// # Panics
    /// If `n` is larger than the buffer.
    pub fn drain(&mut self, mut n: usize) {
        assert!(n <= self.len, "drain of {n} bytes from a {} byte buffer", self.len);

        while n > 0 {
            let Some(head) = self.chunks.front_mut() else { break };
            if head.len > n {
                head.advance(n);
                self.len -= n;
                n = 0;
            } else {
                let drained = head.len;
                self.chunks.pop_front();
                self.len -= drained;
                n -= drained;
            }
        }

        self.debug_check();
    }

    /// Makes the first `min(n, len)` bytes contiguous in the head chunk and returns them.
    ///
    /// The head chunk is repacked in place when it is large enough, and reallocated otherwise.
    /// Bytes from the following chunks are then copied in, freeing any chunk that gets emptied.
    pub fn pullup(&mut self, n: usize) -> &[u8] {
        let n = n.min(self.len);
        let needs_work = self.chunks.front().is_some_and(|head| head.len < n);

        if needs_work {
            let Some(mut head) = self.chunks.pop_front() else { return &[] };
            if head.capacity() >= n {
                head.repack();
            } else {
                head.grow(preferred_chunk_size(n));
            }

            while head.len < n {
                let Some(next) = self.chunks.front_mut() else { break };
                let want = n - head.len;
                let take = next.len.min(want);

                let end = head.off + head.len;
                head.mem[end..end + take].copy_from_slice(&next.data()[..take]);
                head.len += take;
                next.advance(take);

                if next.len == 0 {
                    self.chunks.pop_front();
                }
            }

            self.chunks.push_front(head);
            self.debug_check();
        }

        self.first_chunk()
    }

    /// Returns the offset of the first occurrence of `byte`.
    pub fn find_byte(&self, byte: u8) -> Option<usize> {
        let mut base = 0;
        for chunk in &self.chunks {
            if let Some(i) = chunk.data().iter().position(|b| *b == byte) {
                return Some(base + i);
            }
            base += chunk.len;
        }
        None
    }

    /// Returns the offset of the first occurrence of `needle`, scanning across chunk boundaries.
    pub fn find_substring(&self, needle: &[u8]) -> Option<usize> {
        let (first, _) = needle.split_first()?;

        let mut base = 0;
        for (idx, chunk) in self.chunks.iter().enumerate() {
            for (i, b) in chunk.data().iter().enumerate() {
                if b == first && self.matches_from(idx, i, needle) {
                    return Some(base + i);
                }
            }
            base += chunk.len;
        }
        None
    }

    /// Returns `true` if the bytes at offset `pos` equal `needle`.
    pub fn matches_at(&self, pos: usize, needle: &[u8]) -> bool {
        if pos.saturating_add(needle.len()) > self.len {
            return false;
        }

        let mut base = 0;
        for (idx, chunk) in self.chunks.iter().enumerate() {
            if pos < base + chunk.len {
                return self.matches_from(idx, pos - base, needle);
            }
            base += chunk.len;
        }
        needle.is_empty()
    }

    fn matches_from(&self, chunk_idx: usize, offset: usize, needle: &[u8]) -> bool {
        let mut bytes = self
            .chunks
            .range(chunk_idx..)
            .flat_map(|c| c.data().iter().copied())
            .skip(offset);

        needle.iter().all(|expected| bytes.next() == Some(*expected))
    }

    /// Removes and returns the first line, without its `\n` or `\r\n` terminator.
    /// Returns `None` if no complete line is buffered.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.find_byte(b'\n')?;
        let mut line = vec![0u8; end + 1];
        self.get_bytes(&mut line);

        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    /// Moves up to `n` bytes into `dst`, returning the number moved. Whole chunks are relinked
    /// into `dst`; only a trailing partial chunk is copied.
    pub fn move_to(&mut self, dst: &mut Self, n: usize) -> usize {
        let n = n.min(self.len);
        if n == self.len {
            return self.move_all(dst);
        }
        dst.check_room(n);

        let mut remaining = n;
        while remaining > 0 {
            let Some(head) = self.chunks.front() else { break };

            if head.len <= remaining {
                let Some(chunk) = self.chunks.pop_front() else { break };
                remaining -= chunk.len;
                self.len -= chunk.len;
                dst.push_chunk(chunk);
            } else {
                let tag = head.tag;
                dst.append_inner(&head.data()[..remaining], tag);
                self.drain(remaining);
                remaining = 0;
            }
        }

        self.debug_check();
        dst.debug_check();
        n
    }

    /// Moves every byte into `dst` by relinking chunks, returning the number of bytes moved.
    /// No data is copied.
    pub fn move_all(&mut self, dst: &mut Self) -> usize {
        let moved = self.len;
        if moved == 0 {
            // An empty buffer may still hold a reserved tail; release it like a real move would.
            self.chunks.clear();
            return 0;
        }
        dst.check_room(moved);

        if dst.len == 0 {
            dst.chunks.clear();
            std::mem::swap(&mut dst.chunks, &mut self.chunks);
        } else {
            dst.drop_empty_tail();
            dst.chunks.append(&mut self.chunks);
        }
        dst.len += moved;
        self.len = 0;

        self.debug_check();
        dst.debug_check();
        moved
    }

    /// Replaces the contents of this buffer with a copy of `src`.
    pub fn copy_from(&mut self, src: &Self) {
        self.clear();
        for chunk in &src.chunks {
            self.append_inner(chunk.data(), chunk.tag);
        }
    }

    /// Returns the free space of the tail chunk, first allocating a new chunk sized for `hint`
    /// bytes (capped at [`MAX_CHUNK_ALLOC`]) if the tail has less than [`MIN_READ_LEN`] bytes
    /// free. Use [`Buffer::commit_tail`] to mark the bytes written into the slice as valid.
    pub fn reserve_tail(&mut self, hint: usize) -> &mut [u8] {
        let usable = self.chunks.back().is_some_and(|c| c.spare() >= MIN_READ_LEN && c.tag.is_none());
        if !usable {
            self.add_chunk_with_capacity(hint, true);
        }
        self.tail_mut().spare_mut()
    }

    /// Marks the first `n` bytes of the tail's free space as valid data.
    ///
    /// # Panics
    /// If `n` exceeds the tail's free space.
    pub fn commit_tail(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.check_room(n);

        let tail = self.tail_mut();
        assert!(n <= tail.spare(), "commit of {n} bytes into {} bytes of slack", tail.spare());
        tail.len += n;
        self.len += n;

        self.debug_check();
    }

    /// Checks every buffer invariant, panicking on the first violation.
    pub fn assert_ok(&self) {
        let mut total = 0usize;
        let last = self.chunks.len().saturating_sub(1);

        for (i, chunk) in self.chunks.iter().enumerate() {
            assert!(
                chunk.off + chunk.len <= chunk.capacity(),
                "chunk {i} overruns its allocation: {chunk:?}"
            );
            assert!(i == last || chunk.len > 0, "chunk {i} is empty but is not the tail");
            total += chunk.len;
        }

        assert_eq!(total, self.len, "cached length does not match the chunk list");
        assert!(self.len <= BUF_MAX_LEN, "buffer length {} exceeds the limit", self.len);
    }

    #[inline]
    fn debug_check(&self) {
        #[cfg(debug_assertions)]
        self.assert_ok();
    }

    /// Aborts if adding `n` bytes would take the buffer past [`BUF_MAX_LEN`].
    #[inline]
    fn check_room(&self, n: usize) {
        assert!(
            self.len.checked_add(n).is_some_and(|total| total <= BUF_MAX_LEN),
            "adding {n} bytes to a {} byte buffer would overflow it",
            self.len
        );
    }

    fn tail_mut(&mut self) -> &mut Chunk {
        self.chunks.back_mut().expect("buffer has a tail chunk")
    }

    /// Only the tail may be empty, so an empty tail must go before anything is linked after it.
    fn drop_empty_tail(&mut self) {
        if self.chunks.back().is_some_and(|c| c.len == 0) {
            self.chunks.pop_back();
        }
    }

    fn push_chunk(&mut self, chunk: Chunk) {
        self.drop_empty_tail();
        self.len += chunk.len;
        self.chunks.push_back(chunk);
    }

    /// Links a new tail chunk able to hold `capacity` bytes. Allocations never go below the
    /// buffer's default chunk size; if `capped`, they never go above [`MAX_CHUNK_ALLOC`].
    pub(crate) fn add_chunk_with_capacity(&mut self, capacity: usize, capped: bool) -> &mut Chunk {
        let alloc = if capacity < self.default_chunk_size {
            self.default_chunk_size
        } else if capped && capacity > MAX_CHUNK_ALLOC {
            MAX_CHUNK_ALLOC
        } else {
            preferred_chunk_size(capacity)
        };

        self.drop_empty_tail();
        self.chunks.push_back(Chunk::with_capacity(alloc));
        self.tail_mut()
    }
}

impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for Buffer {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = out.len().min(self.len);
        self.get_bytes(&mut out[..n]);
        Ok(n)
    }
}
