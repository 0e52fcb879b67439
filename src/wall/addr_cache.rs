//! Approximate per-address connection-count cache.
//!
//! External addresses are scattered across cache lines by a keyed
//! 32-bit Feistel permutation; the permuted word splits into a line
//! index and a 16-bit tag. Because the split is injective, a tag match
//! inside a line identifies the stored address exactly — the only
//! approximation is competition for a line's four ways.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Default line count (must be a power of two). Four ways per line at
/// 4 bytes per way makes the default cache 16 MB.
pub const DEFAULT_ADDR_LINES: usize = 1 << 20;

const WAYS: usize = 4;
const FEISTEL_ROUNDS: usize = 24;

/// Keyed 32-bit permutation, not a cipher in any cryptographic sense:
/// its one job is making cache placement unpredictable to an outside
/// host. The Feistel structure makes it a bijection no matter what the
/// round function does, so distinct addresses always permute to
/// distinct words.
pub struct AddrCipher {
    round_keys: [u32; FEISTEL_ROUNDS],
}

impl AddrCipher {
    pub fn new(seed: [u8; 16]) -> Self {
        let mut expanded = [0u8; 32];
        expanded[..16].copy_from_slice(&seed);
        expanded[16..].copy_from_slice(&seed);
        let mut rng = ChaCha20Rng::from_seed(expanded);
        let mut round_keys = [0u32; FEISTEL_ROUNDS];
        for key in round_keys.iter_mut() {
            *key = rng.r#gen();
        }
        Self { round_keys }
    }

    fn round(half: u16, key: u32) -> u16 {
        (((half as u32 ^ key).wrapping_mul(0x9e37_79b1)) >> 16) as u16
    }

    pub fn encrypt(&self, value: u32) -> u32 {
        let mut left = (value >> 16) as u16;
        let mut right = value as u16;
        for key in self.round_keys {
            let swapped = right;
            right = left ^ Self::round(right, key);
            left = swapped;
        }
        ((left as u32) << 16) | right as u32
    }

    pub fn decrypt(&self, value: u32) -> u32 {
        let mut left = (value >> 16) as u16;
        let mut right = value as u16;
        for key in self.round_keys.iter().rev() {
            let swapped = left;
            left = right ^ Self::round(left, *key);
            right = swapped;
        }
        ((left as u32) << 16) | right as u32
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Way {
    tag: u16,
    count: i16,
}

pub struct AddrCache {
    lines: Vec<[Way; WAYS]>,
    cipher: AddrCipher,
    line_mask: u32,
    c_min: i16,
    c_max: i16,
}

impl AddrCache {
    pub fn new(lines: usize, seed: [u8; 16], c_min: i16, c_max: i16) -> Self {
        assert!(lines.is_power_of_two(), "line count must be a power of two");
        assert!(c_min < c_max);
        Self {
            lines: vec![[Way::default(); WAYS]; lines],
            cipher: AddrCipher::new(seed),
            line_mask: (lines - 1) as u32,
            c_min,
            c_max,
        }
    }

    /// (line index, tag) for an address. The permuted word is
    /// reconstructible from the index's low 16 bits plus the tag, so
    /// two addresses can never agree on both.
    fn split(&self, addr: u32) -> (usize, u16) {
        let permuted = self.cipher.encrypt(addr);
        ((permuted & self.line_mask) as usize, (permuted >> 16) as u16)
    }

    /// Current count for an address; 0 when it is not cached.
    pub fn count(&self, addr: u32) -> i16 {
        let (index, tag) = self.split(addr);
        for way in &self.lines[index] {
            if way.tag == tag {
                return way.count;
            }
        }
        0
    }

    /// Store a count. A value at or beyond either clamp bound is a
    /// no-op, which is what clamps the stored range. With no matching
    /// tag and a full line, the way holding the minimum count is
    /// evicted: the best-behaved address is the cheapest victim, and a
    /// blocked host's positive count survives.
    pub fn set_count(&mut self, addr: u32, count: i16) {
        if count >= self.c_max || count <= self.c_min {
            return;
        }
        let (index, tag) = self.split(addr);
        let line = &mut self.lines[index];
        if let Some(way) = line.iter_mut().find(|w| w.tag == tag) {
            way.count = count;
            return;
        }
        let mut victim = 0;
        for i in 1..WAYS {
            if line[i].count < line[victim].count {
                victim = i;
            }
        }
        line[victim] = Way { tag, count };
    }

    /// Miss-count decay: every strictly positive count drops by one.
    /// Zero and negative counts are left alone.
    pub fn decay_sweep(&mut self) {
        for line in self.lines.iter_mut() {
            for way in line.iter_mut() {
                if way.count > 0 {
                    way.count -= 1;
                }
            }
        }
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}
