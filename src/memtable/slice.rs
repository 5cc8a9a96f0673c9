//! Single key/value record

/// Bytes charged per record on top of key and value
/// (two u64 length fields and a tombstone byte)
pub const RECORD_OVERHEAD: usize = 8 + 8 + 1;

/// One record, exclusively owned by its container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub tombstone: bool,
    /// Owning rank of the key
    pub rank: usize,
}

impl Slice {
    pub fn new(key: Vec<u8>, value: Vec<u8>, rank: usize) -> Self {
        Self {
            key,
            value,
            tombstone: false,
            rank,
        }
    }

    pub fn tombstone(key: Vec<u8>, rank: usize) -> Self {
        Self {
            key,
            value: Vec::new(),
            tombstone: true,
            rank,
        }
    }

    /// Accounted size of the record in bytes
    pub fn size(&self) -> usize {
        Self::record_size(self.key.len(), self.value.len())
    }

    pub fn record_size(key_len: usize, value_len: usize) -> usize {
        key_len + value_len + RECORD_OVERHEAD
    }

    /// Replace the value, reusing the buffer when the length matches
    pub fn replace_value(&mut self, value: &[u8]) {
        if self.value.len() == value.len() {
            self.value.copy_from_slice(value);
        } else {
            self.value = value.to_vec();
        }
    }
}
