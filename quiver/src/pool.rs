//! Pre-allocated datagram buffer pool.
//!
//! Buffers are handed out for socket receives and returned (with their
//! capacity intact) once the RX pipeline is done with them. Running dry is
//! a back-pressure signal, not an allocation site.

use bytes::BytesMut;
use tracing::warn;

pub struct BufferPool {
    free: Vec<BytesMut>,
    buf_len: usize,
    total: usize,
}

impl BufferPool {
    /// Allocate `num_bufs` buffers of `buf_len` bytes up front.
    pub fn new(num_bufs: usize, buf_len: usize) -> Self {
        let free = (0..num_bufs)
            .map(|_| BytesMut::with_capacity(buf_len))
            .collect();
        Self {
            free,
            buf_len,
            total: num_bufs,
        }
    }

    /// Take a buffer, resized to full capacity for a socket read. `None`
    /// when the pool is exhausted.
    pub fn get(&mut self) -> Option<BytesMut> {
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.resize(self.buf_len, 0);
                Some(buf)
            }
            None => {
                warn!("buffer pool exhausted");
                None
            }
        }
    }

    /// Return a buffer to the pool. Buffers that lost capacity (split off
    /// and retained elsewhere) are dropped and replaced.
    pub fn put(&mut self, buf: BytesMut) {
        if self.free.len() >= self.total {
            return;
        }
        if buf.capacity() >= self.buf_len {
            self.free.push(buf);
        } else {
            self.free.push(BytesMut::with_capacity(self.buf_len));
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_put_cycle() {
        let mut pool = BufferPool::new(2, 128);
        let a = pool.get().unwrap();
        assert_eq!(a.len(), 128);
        let b = pool.get().unwrap();
        assert!(pool.get().is_none());
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn shrunk_buffers_are_replaced() {
        let mut pool = BufferPool::new(1, 128);
        let mut buf = pool.get().unwrap();
        let _stolen = buf.split_off(8); // capacity leaves with the tail
        pool.put(buf);
        let replacement = pool.get().unwrap();
        assert_eq!(replacement.len(), 128);
    }
}
