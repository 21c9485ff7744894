use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing.
///
/// Every task in a graph is identified by the hash of its definition, so two
/// structurally identical computations share a single node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Content-derived identity of a task.
///
/// A `TaskId` is the BLAKE3 digest of the task's operation tag, its callable
/// name, its keyword arguments, its literal arguments, and the ids of the
/// tasks it depends on. Identity is therefore structural: building the same
/// expression twice yields the same id, and graph assembly deduplicates the
/// nodes. Note that the *callable name* participates in the hash, not the
/// closure itself, so two different functions registered under one name
/// collapse into one node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Hash32);

impl TaskId {
    pub(crate) fn from_hasher(hasher: &blake3::Hasher) -> Self {
        TaskId(hasher.finalize().into())
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0.0
    }

    /// The full 64-character hex rendering of the id.
    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Abbreviated, enough to identify a task in logs and errors.
        write!(f, "{}", &self.0.to_hex()[..12])
    }
}

impl std::fmt::Debug for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskId({self})")
    }
}
