//! Growable byte queue used to stage channel data

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};

/// Minimum allocation for a new tail block
const BLOCK_SIZE: usize = 4096;

/// A FIFO of bytes stored as a queue of contiguous blocks.
///
/// Writers reserve space at the tail, fill it, then [`chop`](Self::chop) off
/// whatever they did not use. Readers consume from the head one contiguous
/// block at a time.
#[derive(Debug, Default)]
pub struct RingBuffer {
    blocks: VecDeque<BytesMut>,
    len: usize,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of buffered bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }

    /// Appends `data` at the tail
    pub fn append(&mut self, data: &[u8]) {
        self.reserve(data.len()).copy_from_slice(data);
    }

    /// Grows the tail by `n` zeroed bytes and returns them for filling
    pub fn reserve(&mut self, n: usize) -> &mut [u8] {
        if n == 0 {
            return &mut [];
        }

        let fits = self
            .blocks
            .back()
            .is_some_and(|tail| tail.capacity() - tail.len() >= n);
        if !fits {
            self.blocks.push_back(BytesMut::with_capacity(n.max(BLOCK_SIZE)));
        }

        let Some(tail) = self.blocks.back_mut() else {
            return &mut [];
        };
        self.len += n;
        let start = tail.len();
        tail.resize(start + n, 0);
        &mut tail[start..]
    }

    /// Removes up to `n` bytes from the tail
    pub fn chop(&mut self, mut n: usize) {
        while n > 0 {
            let Some(tail) = self.blocks.back_mut() else {
                break;
            };
            if tail.len() > n {
                let keep = tail.len() - n;
                tail.truncate(keep);
                self.len -= n;
                break;
            }
            n -= tail.len();
            self.len -= tail.len();
            self.blocks.pop_back();
        }
    }

    /// First contiguous block of readable data
    pub fn read_pointer(&self) -> &[u8] {
        self.blocks.front().map_or(&[][..], |block| &block[..])
    }

    pub fn next_data_block_size(&self) -> usize {
        self.read_pointer().len()
    }

    /// Drops up to `n` bytes from the head
    pub fn free(&mut self, mut n: usize) {
        while n > 0 {
            let Some(head) = self.blocks.front_mut() else {
                break;
            };
            if head.len() > n {
                head.advance(n);
                self.len -= n;
                break;
            }
            n -= head.len();
            self.len -= head.len();
            self.blocks.pop_front();
        }
    }

    pub fn get_char(&mut self) -> Option<u8> {
        let c = *self.read_pointer().first()?;
        self.free(1);
        Some(c)
    }

    /// Pushes `c` back in front of the head
    pub fn unget_char(&mut self, c: u8) {
        self.blocks.push_front(BytesMut::from(&[c][..]));
        self.len += 1;
    }

    /// Moves up to `out.len()` bytes into `out`, returning how many were copied
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < out.len() && !self.is_empty() {
            let block = self.read_pointer();
            let n = block.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&block[..n]);
            copied += n;
            self.free(n);
        }
        copied
    }

    pub fn read_all(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for block in self.blocks.drain(..) {
            out.extend_from_slice(&block);
        }
        self.len = 0;
        out
    }

    pub fn can_read_line(&self) -> bool {
        self.blocks.iter().any(|block| block.contains(&b'\n'))
    }

    /// Removes one line including its terminating `\n`, or everything if no
    /// newline is buffered.
    pub fn read_line(&mut self) -> Vec<u8> {
        let mut line = Vec::new();
        while let Some(head) = self.blocks.front_mut() {
            match head.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    line.extend_from_slice(&head[..=pos]);
                    self.free(pos + 1);
                    return line;
                }
                None => {
                    line.extend_from_slice(head);
                    let n = head.len();
                    self.free(n);
                }
            }
        }
        line
    }
}
