//! Seeds: stateless counter-based keys and legacy integer seeds.
//!
//! Stateless keys are split deterministically with ThreeFry-2x32, so the same
//! key always yields the same children. Legacy integer seeds drive a
//! [`SeedStream`], a salted hash sequence that hands out one integer per draw.

use rand::SeedableRng;
use rand::rngs::StdRng;
use sha2::{Digest, Sha256};

const ROTATIONS: [u32; 8] = [13, 15, 26, 6, 17, 29, 16, 24];
const NUM_ROUNDS: usize = 20;
const KS_PARITY: u32 = 0x1BD1_1BDA;

/// ThreeFry-2x32 block function (20 rounds).
pub fn threefry2x32(key: [u32; 2], data: [u32; 2]) -> [u32; 2] {
    let ks = [key[0], key[1], key[0] ^ key[1] ^ KS_PARITY];
    let mut x0 = data[0].wrapping_add(ks[0]);
    let mut x1 = data[1].wrapping_add(ks[1]);
    for round in 0..NUM_ROUNDS {
        x0 = x0.wrapping_add(x1);
        x1 = x1.rotate_left(ROTATIONS[round % 8]) ^ x0;
        if (round + 1) % 4 == 0 {
            let inject = (round + 1) / 4;
            x0 = x0.wrapping_add(ks[inject % 3]);
            x1 = x1.wrapping_add(ks[(inject + 1) % 3].wrapping_add(inject as u32));
        }
    }
    [x0, x1]
}

/// A stateless seed: two 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SeedKey(pub [u32; 2]);

impl SeedKey {
    /// Key from a 64-bit integer (high word first).
    pub fn from_u64(seed: u64) -> Self {
        SeedKey([(seed >> 32) as u32, seed as u32])
    }

    /// Deterministically derive `n` independent child keys.
    pub fn split(self, n: usize) -> Vec<SeedKey> {
        (0..n).map(|i| SeedKey(threefry2x32(self.0, [0, i as u32]))).collect()
    }

    /// Split into a pair `(sample_key, remaining_key)`.
    pub fn split2(self) -> (SeedKey, SeedKey) {
        (SeedKey(threefry2x32(self.0, [0, 0])), SeedKey(threefry2x32(self.0, [0, 1])))
    }

    /// Mix a word into the key.
    pub fn fold_in(self, data: u32) -> SeedKey {
        SeedKey(threefry2x32(self.0, [data, 0]))
    }

    /// Mix a string salt into the key.
    pub fn fold_in_salt(self, salt: &str) -> SeedKey {
        self.fold_in(hash_words(&[salt.as_bytes()]) as u32)
    }

    /// The key as a 64-bit integer.
    pub fn as_u64(self) -> u64 {
        ((self.0[0] as u64) << 32) | self.0[1] as u64
    }

    /// A standard RNG seeded from this key.
    pub fn to_rng(self) -> StdRng {
        StdRng::seed_from_u64(self.as_u64())
    }
}

/// A seed as accepted by sampling routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Seed {
    /// Counter-based key; splitting never touches global state.
    Stateless(SeedKey),
    /// Legacy integer seed.
    Stateful(u64),
}

impl Seed {
    /// `true` for legacy integer seeds.
    pub fn is_stateful(&self) -> bool {
        matches!(self, Seed::Stateful(_))
    }

    /// A standard RNG driven by this seed.
    pub fn to_rng(&self) -> StdRng {
        match self {
            Seed::Stateless(k) => k.to_rng(),
            Seed::Stateful(s) => StdRng::seed_from_u64(*s),
        }
    }
}

impl From<SeedKey> for Seed {
    fn from(k: SeedKey) -> Self {
        Seed::Stateless(k)
    }
}

/// Turn any seed (or none) into a stateless key, mixing in `salt`.
///
/// `None` draws fresh entropy from the thread RNG.
pub fn sanitize_seed(seed: Option<&Seed>, salt: &str) -> SeedKey {
    match seed {
        Some(Seed::Stateless(k)) => k.fold_in_salt(salt),
        Some(Seed::Stateful(s)) => SeedKey::from_u64(hash_words(&[&s.to_le_bytes(), salt.as_bytes()])),
        None => SeedKey::from_u64(rand::random::<u64>()),
    }
}

/// Salted, deterministic sequence of integer seeds derived from one legacy seed.
#[derive(Debug, Clone)]
pub struct SeedStream {
    seed: u64,
    salt: String,
    count: u64,
}

impl SeedStream {
    /// Start a stream.
    pub fn new(seed: u64, salt: impl Into<String>) -> Self {
        Self { seed, salt: salt.into(), count: 0 }
    }

    /// Next integer seed.
    pub fn next_seed(&mut self) -> u64 {
        self.count += 1;
        hash_words(&[&self.seed.to_le_bytes(), self.salt.as_bytes(), &self.count.to_le_bytes()])
    }

    /// Number of seeds handed out so far.
    pub fn count(&self) -> u64 {
        self.count
    }
}

fn hash_words(parts: &[&[u8]]) -> u64 {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update((p.len() as u64).to_le_bytes());
        hasher.update(p);
    }
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(word)
}
