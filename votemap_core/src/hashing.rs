use std::hash::Hasher;

/// A deterministic FNV-1a 64-bit hasher.
///
/// `DefaultHasher` is randomly keyed per process, which would make seeded
/// cycles irreproducible across restarts.
#[derive(Debug)]
pub struct FnvHasher {
    state: u64,
}

impl FnvHasher {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self {
            state: Self::OFFSET_BASIS,
        }
    }
}

impl Default for FnvHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(Self::PRIME);
        }
    }
}

/// Seed for one swap cycle's RNG, derived from the configured seed and the
/// round the cycle belongs to.
pub fn derive_cycle_seed(seed: u64, round_index: Option<u64>) -> u64 {
    let mut hasher = FnvHasher::new();
    hasher.write(&seed.to_le_bytes());
    match round_index {
        Some(index) => {
            hasher.write(&[1]);
            hasher.write(&index.to_le_bytes());
        }
        None => hasher.write(&[0]),
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_vectors() {
        let mut hasher = FnvHasher::new();
        hasher.write(b"");
        assert_eq!(hasher.finish(), 0xcbf29ce484222325);

        let mut hasher = FnvHasher::new();
        hasher.write(b"a");
        assert_eq!(hasher.finish(), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn cycle_seeds_depend_on_round() {
        assert_eq!(derive_cycle_seed(9, Some(3)), derive_cycle_seed(9, Some(3)));
        assert_ne!(derive_cycle_seed(9, Some(3)), derive_cycle_seed(9, Some(4)));
        assert_ne!(derive_cycle_seed(9, Some(3)), derive_cycle_seed(10, Some(3)));
        assert_ne!(derive_cycle_seed(9, None), derive_cycle_seed(9, Some(0)));
    }
}
