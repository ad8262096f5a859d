//! Pooled payload buffers.

use crate::error::PoolResult;
use crate::free_list::{FreeList, FreeListConfig, Pooled, Reset};

/// A growable byte buffer that shrinks back to its nominal size on reset.
#[derive(Debug, Clone)]
pub struct PayloadBuf {
    data: Vec<u8>,
    element_size: usize,
}

impl PayloadBuf {
    /// Create an empty buffer with `element_size` bytes of capacity.
    pub fn with_capacity(element_size: usize) -> Self {
        Self {
            data: Vec::with_capacity(element_size),
            element_size,
        }
    }

    /// Resize the buffer to exactly `len` zeroed bytes.
    pub fn prepare(&mut self, len: usize) {
        self.data.clear();
        self.data.resize(len, 0);
    }

    /// Current contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the current contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.clone()
    }
}

impl Reset for PayloadBuf {
    fn reset(&mut self) {
        self.data.clear();
        if self.data.capacity() > self.element_size {
            self.data.shrink_to(self.element_size);
        }
    }
}

impl AsRef<[u8]> for PayloadBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// A payload buffer on loan from a pool.
pub type PooledBuf = Pooled<PayloadBuf>;

/// Build a pool of payload buffers sized by `config.element_size`.
pub fn payload_pool(config: FreeListConfig) -> PoolResult<FreeList<PayloadBuf>> {
    let element_size = config.element_size;
    FreeList::new(config, move || PayloadBuf::with_capacity(element_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_shrinks_oversized_buffer() {
        let pool = payload_pool(FreeListConfig::new(16, 1, 1, 0)).expect("pool");
        let mut buf = pool.try_get().expect("buf");
        buf.prepare(1024);
        buf.as_mut_slice()[1023] = 7;
        assert_eq!(buf.len(), 1024);
        drop(buf);

        let buf = pool.try_get().expect("buf");
        assert!(buf.is_empty());
        assert!(buf.data.capacity() < 1024);
    }
}
