//! Identifier schemes under test.
//!
//! The engine only needs something that hands out one string per call; the
//! registry maps scheme names to factories so every run gets a generator with
//! its own state.

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::stress::error::{StressError, StressResult};

/// Produces one identifier per call. Must tolerate concurrent callers.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

impl<F> IdGenerator for F
where
    F: Fn() -> String + Send + Sync,
{
    fn generate(&self) -> String {
        self()
    }
}

pub type GeneratorFactory = Arc<dyn Fn() -> Arc<dyn IdGenerator> + Send + Sync>;

const NANOID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz-";
const NANOID_LENGTH: usize = 16;

const CROCKFORD_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ULID_LENGTH: usize = 26;
const ULID_TIME_BITS: u32 = 48;
const ULID_RANDOM_BITS: u32 = 80;

const BASE62_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const KSUID_LENGTH: usize = 27;
const KSUID_EPOCH: i64 = 1_400_000_000;
const KSUID_PAYLOAD_BYTES: usize = 16;

const CUSTOM_UID_LENGTH: usize = 16;
/// 2025-10-01T00:00:00Z
const CUSTOM_UID_EPOCH: i64 = 1_759_248_000;
const CUSTOM_UID_TIMESTAMP_BITS: u32 = 50;
const CUSTOM_UID_COUNTER_BITS: u32 = 16;
const CUSTOM_UID_RANDOM_BITS: u32 = 14;
const CUSTOM_UID_MAX_COUNTER: u32 = (1 << CUSTOM_UID_COUNTER_BITS) - 1;

#[derive(Clone)]
pub struct SchemeRegistry {
    factories: BTreeMap<String, GeneratorFactory>,
}

impl Default for SchemeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SchemeRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with `nanoid16`, `ulid`, `ksuid` and `customuid`, plus the
    /// `nanoid` and `custom` aliases.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_generator("nanoid16", || NanoIdGenerator::new(NANOID_LENGTH));
        registry.register_generator("nanoid", || NanoIdGenerator::new(NANOID_LENGTH));
        registry.register_generator("ulid", || UlidGenerator);
        registry.register_generator("ksuid", || KsuidGenerator);
        registry.register_generator("customuid", CustomUidGenerator::new);
        registry.register_generator("custom", CustomUidGenerator::new);
        registry
    }

    pub fn register(&mut self, name: &str, factory: GeneratorFactory) {
        self.factories.insert(normalize_name(name), factory);
    }

    /// Registers a factory for a concrete generator type.
    pub fn register_generator<G, F>(&mut self, name: &str, make: F)
    where
        G: IdGenerator + 'static,
        F: Fn() -> G + Send + Sync + 'static,
    {
        self.register(
            name,
            Arc::new(move || Arc::new(make()) as Arc<dyn IdGenerator>),
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&normalize_name(name))
    }

    /// Builds a fresh generator for `name`, matched case-insensitively.
    pub fn resolve(&self, name: &str) -> StressResult<Arc<dyn IdGenerator>> {
        self.factories
            .get(&normalize_name(name))
            .map(|factory| factory())
            .ok_or_else(|| {
                StressError::config(format!(
                    "unknown scheme {:?} (known: {})",
                    name,
                    self.names().join(", ")
                ))
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Random string over `0-9a-z-`.
#[derive(Debug, Clone, Copy)]
pub struct NanoIdGenerator {
    length: usize,
}

impl NanoIdGenerator {
    pub fn new(length: usize) -> Self {
        Self { length }
    }
}

impl IdGenerator for NanoIdGenerator {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| NANOID_ALPHABET[rng.gen_range(0..NANOID_ALPHABET.len())] as char)
            .collect()
    }
}

/// 48-bit millisecond timestamp followed by 80 random bits, Crockford base32.
#[derive(Debug, Clone, Copy, Default)]
pub struct UlidGenerator;

impl IdGenerator for UlidGenerator {
    fn generate(&self) -> String {
        let millis = Utc::now().timestamp_millis().max(0) as u128 & ((1u128 << ULID_TIME_BITS) - 1);
        let random = rand::thread_rng().gen::<u128>() & ((1u128 << ULID_RANDOM_BITS) - 1);
        encode_crockford((millis << ULID_RANDOM_BITS) | random, ULID_LENGTH)
    }
}

/// 32-bit seconds since the KSUID epoch followed by 128 random bits, base62.
#[derive(Debug, Clone, Copy, Default)]
pub struct KsuidGenerator;

impl IdGenerator for KsuidGenerator {
    fn generate(&self) -> String {
        let seconds = (Utc::now().timestamp() - KSUID_EPOCH).clamp(0, u32::MAX as i64) as u32;
        let mut raw = [0u8; 4 + KSUID_PAYLOAD_BYTES];
        raw[..4].copy_from_slice(&seconds.to_be_bytes());
        rand::thread_rng().fill(&mut raw[4..]);
        encode_base62(&raw)
    }
}

#[derive(Debug, Default)]
struct CustomUidState {
    last_second: Option<i64>,
    counter: u32,
    random_base: u32,
}

/// 16-char Crockford base32 over 80 bits: seconds since 2025-10-01 (50 bits),
/// a per-second counter (16 bits) and a random base drawn once per second
/// (14 bits). Counter state belongs to the instance.
#[derive(Debug, Default)]
pub struct CustomUidGenerator {
    state: Mutex<CustomUidState>,
}

impl CustomUidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_at(&self, now: i64) -> String {
        let max_timestamp = (1u64 << CUSTOM_UID_TIMESTAMP_BITS) - 1;
        let timestamp = ((now - CUSTOM_UID_EPOCH).max(0) as u64).min(max_timestamp);

        let (counter, random_base) = {
            let mut state = self.state.lock();
            if state.last_second != Some(now) {
                state.last_second = Some(now);
                state.counter = 0;
                state.random_base = draw_random_base();
            }

            state.counter += 1;
            if state.counter > CUSTOM_UID_MAX_COUNTER {
                // Counter space for this second is spent; reseed instead of
                // waiting for the clock.
                state.random_base = draw_random_base();
                state.counter = 1;
            }
            (state.counter, state.random_base)
        };

        let tail = ((counter as u128) << CUSTOM_UID_RANDOM_BITS) | random_base as u128;
        let value = ((timestamp as u128) << (CUSTOM_UID_COUNTER_BITS + CUSTOM_UID_RANDOM_BITS)) | tail;
        encode_crockford(value, CUSTOM_UID_LENGTH)
    }
}

impl IdGenerator for CustomUidGenerator {
    fn generate(&self) -> String {
        self.generate_at(Utc::now().timestamp())
    }
}

fn draw_random_base() -> u32 {
    (rand::thread_rng().gen::<u16>() as u32) >> 2
}

/// Big-endian base32 of the low `length * 5` bits of `value`.
fn encode_crockford(value: u128, length: usize) -> String {
    (0..length)
        .map(|i| {
            let shift = (length - 1 - i) * 5;
            CROCKFORD_ALPHABET[((value >> shift) & 0x1f) as usize] as char
        })
        .collect()
}

/// Fixed-width base62 of a 20-byte big-endian number, zero padded.
fn encode_base62(raw: &[u8; 4 + KSUID_PAYLOAD_BYTES]) -> String {
    let mut words = [0u32; 5];
    for (word, bytes) in words.iter_mut().zip(raw.chunks_exact(4)) {
        *word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }

    let mut out = [b'0'; KSUID_LENGTH];
    for slot in out.iter_mut().rev() {
        let mut remainder = 0u64;
        for word in words.iter_mut() {
            let acc = (remainder << 32) | *word as u64;
            *word = (acc / 62) as u32;
            remainder = acc % 62;
        }
        *slot = BASE62_ALPHABET[remainder as usize];
    }

    out.iter().map(|&b| b as char).collect()
}
