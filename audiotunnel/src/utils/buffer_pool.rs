use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::warn;

use crate::structs::buffer::TransferBuffer;
use crate::utils::errors::PoolError;

/// A fixed set of equally sized transfer buffers shared between a producer
/// and the stage that consumes them.
///
/// Buffers are handed out by [`acquire`](Self::acquire) and come back through
/// [`release`](Self::release) once the consumer is done with them. Acquiring
/// blocks for at most the given timeout, so a stalled consumer surfaces as
/// [`PoolError::Timeout`] instead of hanging the producer.
#[derive(Debug)]
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    available: Condvar,
    buffer_count: usize,
    buffer_capacity: usize,
}

#[derive(Debug)]
struct PoolInner {
    free: VecDeque<TransferBuffer>,
    closed: bool,
}

impl BufferPool {
    /// Creates a pool holding `buffer_count` zeroed buffers of
    /// `buffer_capacity` bytes each.
    pub fn new(buffer_count: usize, buffer_capacity: usize) -> Self {
        let free = (0..buffer_count)
            .map(|index| TransferBuffer::new(index, buffer_capacity))
            .collect();

        Self {
            inner: Mutex::new(PoolInner {
                free,
                closed: false,
            }),
            available: Condvar::new(),
            buffer_count,
            buffer_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a free buffer, waiting up to `timeout` for one to be released.
    pub fn acquire(&self, timeout: Duration) -> Result<TransferBuffer, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();

        loop {
            if inner.closed {
                return Err(PoolError::Closed);
            }
            if let Some(buffer) = inner.free.pop_front() {
                return Ok(buffer);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Timeout(timeout));
            }

            inner = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Takes a free buffer without waiting.
    pub fn try_acquire(&self) -> Option<TransferBuffer> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        inner.free.pop_front()
    }

    /// Returns a buffer to the pool. Its contents and metadata are cleared.
    pub fn release(&self, mut buffer: TransferBuffer) -> Result<(), PoolError> {
        if buffer.capacity() != self.buffer_capacity {
            return Err(PoolError::CapacityMismatch {
                expected: self.buffer_capacity,
                actual: buffer.capacity(),
            });
        }

        buffer.reset();

        let mut inner = self.lock();
        if inner.free.len() >= self.buffer_count {
            warn!("Buffer {} released into a full pool, dropping it", buffer.index());
            return Ok(());
        }
        inner.free.push_back(buffer);
        drop(inner);

        self.available.notify_one();
        Ok(())
    }

    /// Wakes every waiter and refuses further acquisitions.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    /// Bytes of input the consumer can accept right now.
    pub fn free_bytes(&self) -> usize {
        self.free_count() * self.buffer_capacity
    }

    pub fn total_bytes(&self) -> usize {
        self.buffer_count * self.buffer_capacity
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn exhausted_pool_times_out() {
        let pool = BufferPool::new(2, 16);
        let a = pool.acquire(Duration::ZERO).unwrap();
        let _b = pool.acquire(Duration::ZERO).unwrap();

        assert_eq!(pool.free_bytes(), 0);
        assert_eq!(
            pool.acquire(Duration::from_millis(10)),
            Err(PoolError::Timeout(Duration::from_millis(10)))
        );

        pool.release(a).unwrap();
        assert_eq!(pool.free_bytes(), 16);
    }

    #[test]
    fn release_wakes_waiter() {
        let pool = Arc::new(BufferPool::new(1, 8));
        let held = pool.acquire(Duration::ZERO).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire(Duration::from_secs(5)).map(|b| b.index()))
        };

        thread::sleep(Duration::from_millis(20));
        pool.release(held).unwrap();

        assert_eq!(waiter.join().unwrap(), Ok(0));
    }

    #[test]
    fn close_interrupts_waiters() {
        let pool = Arc::new(BufferPool::new(1, 8));
        let _held = pool.acquire(Duration::ZERO).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire(Duration::from_secs(5)).map(|_| ()))
        };

        thread::sleep(Duration::from_millis(20));
        pool.close();

        assert_eq!(waiter.join().unwrap(), Err(PoolError::Closed));
    }

    #[test]
    fn foreign_buffer_is_refused() {
        let pool = BufferPool::new(1, 8);
        let foreign = TransferBuffer::new(0, 4);

        assert_eq!(
            pool.release(foreign),
            Err(PoolError::CapacityMismatch {
                expected: 8,
                actual: 4
            })
        );
    }
}
