//! Sharder implementation.

/// Number of buckets an entity can land in.
pub const TOTAL_BUCKET_NUM: u32 = 1000;

pub trait Sharder {
    fn get_bucket(&self, input: impl AsRef<[u8]>, total_buckets: u32) -> u32;
}

/// The default (and only) sharder: CRC32 (IEEE, polynomial 0xEDB88320) of the input bytes modulo
/// the number of buckets.
pub struct Crc32Sharder;

impl Sharder for Crc32Sharder {
    fn get_bucket(&self, input: impl AsRef<[u8]>, total_buckets: u32) -> u32 {
        crc32fast::hash(input.as_ref()) % total_buckets
    }
}

/// Bucket of `entity_id` under `salt`. Hash input is `salt + entity_id` without a separator.
pub fn bucket(sharder: &impl Sharder, salt: &str, entity_id: &str) -> u32 {
    let mut input = String::with_capacity(salt.len() + entity_id.len());
    input.push_str(salt);
    input.push_str(entity_id);
    sharder.get_bucket(input, TOTAL_BUCKET_NUM)
}

#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, u32>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_bucket(&self, input: impl AsRef<[u8]>, total_buckets: u32) -> u32 {
        let key = String::from_utf8_lossy(input.as_ref());
        self.0.get(key.as_ref()).copied().unwrap_or(0) % total_buckets
    }
}
