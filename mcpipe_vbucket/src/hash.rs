use std::hash::Hasher;

/// Maps a key to a 32 bit digest; the shard is the digest modulo the shard count.
pub trait KeyHasher: Send + Sync {
    fn digest(&self, key: &[u8]) -> u32;
}

/// The vbucket hash: the upper half of the IEEE CRC32, masked to 15 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32Hasher;

impl KeyHasher for Crc32Hasher {
    fn digest(&self, key: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key);
        (hasher.finalize() >> 16) & 0x7fff
    }
}

impl<H: KeyHasher + ?Sized> KeyHasher for Box<H> {
    fn digest(&self, key: &[u8]) -> u32 {
        (**self).digest(key)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FnvKeyHasher;

impl KeyHasher for FnvKeyHasher {
    fn digest(&self, key: &[u8]) -> u32 {
        let mut hasher = fnv::FnvHasher::default();
        hasher.write(key);
        hasher.finish() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_digest() {
        // crc32("hello") = 0x3610a686
        assert_eq!(Crc32Hasher.digest(b"hello"), 0x3610);
        assert!(Crc32Hasher.digest(b"a much longer key than that") <= 0x7fff);
    }

    #[test]
    fn digests_are_stable() {
        for hasher in [&Crc32Hasher as &dyn KeyHasher, &FnvKeyHasher as &dyn KeyHasher].iter() {
            assert_eq!(hasher.digest(b"k1"), hasher.digest(b"k1"));
        }
    }
}
