use crate::{Hash, HASH_SIZE};
use blake2b_simd::{Params, State};

const NODE_HASH_DOMAIN: &[u8] = b"VStateNodeHash";

/// Keyed blake2b-256 hasher producing the content address of a state node
#[derive(Clone)]
pub struct NodeHasher(State);

impl NodeHasher {
    #[inline(always)]
    pub fn new() -> Self {
        Self(Params::new().hash_length(HASH_SIZE).key(NODE_HASH_DOMAIN).to_state())
    }

    pub fn update<A: AsRef<[u8]>>(&mut self, data: A) -> &mut Self {
        self.0.update(data.as_ref());
        self
    }

    #[inline(always)]
    pub fn finalize(self) -> Hash {
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(self.0.finalize().as_bytes());
        Hash::from_bytes(out)
    }

    #[inline(always)]
    pub fn hash<A: AsRef<[u8]>>(data: A) -> Hash {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }
}

impl Default for NodeHasher {
    fn default() -> Self {
        Self::new()
    }
}
