use std::fmt;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use crate::scan::FileCandidate;

/// Hex-encoded digest identifying a file for cache membership
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The inputs mixed into a fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintScheme {
    /// File name and size. Survives timestamp-only changes.
    NameSize,
    /// File name, size and modification time, as written by older caches
    NameSizeModified,
}

/// Every scheme still honored on lookup, current first
pub const SCHEMES: [FingerprintScheme; 2] = [
    FingerprintScheme::NameSize,
    FingerprintScheme::NameSizeModified,
];

/// Scheme used for new cache entries
pub const CURRENT_SCHEME: FingerprintScheme = FingerprintScheme::NameSize;

impl FingerprintScheme {
    pub fn fingerprint(&self, candidate: &FileCandidate) -> Fingerprint {
        let mut input = format!("{}{}", candidate.file_name(), candidate.size);
        if *self == FingerprintScheme::NameSizeModified {
            input.push_str(&legacy_timestamp(candidate));
        }
        digest(&input)
    }
}

/// All fingerprints a candidate may be stored under
pub fn all_fingerprints(candidate: &FileCandidate) -> Vec<Fingerprint> {
    SCHEMES.iter().map(|s| s.fingerprint(candidate)).collect()
}

// Legacy caches rendered the UTC mtime as en-US "M/d/yyyy h:mm:ss AM"
fn legacy_timestamp(candidate: &FileCandidate) -> String {
    let modified: DateTime<Utc> = candidate.modified.into();
    modified.format("%-m/%-d/%Y %-I:%M:%S %p").to_string()
}

fn digest(input: &str) -> Fingerprint {
    let hash = Sha256::digest(input.as_bytes());
    Fingerprint(hex::encode_upper(hash))
}
