//! Content fingerprints used as a proxy for byte-exact equality

use clap::ValueEnum;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

/// Size of the read buffer used when streaming file content
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Capability that turns a byte stream into a hex digest.
///
/// Implementations must be deterministic: equal input bytes always produce an
/// equal string. Unequal input may collide, which is what paranoid
/// verification exists for.
pub trait Fingerprint: Send + Sync {
    fn name(&self) -> &str;

    fn fingerprint(&self, reader: &mut dyn Read) -> io::Result<String>;
}

/// Open `path` and stream it through `fingerprint`
pub fn fingerprint_file(fingerprint: &dyn Fingerprint, path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    fingerprint.fingerprint(&mut file)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// 128-bit MD5
    #[default]
    Md5,
    /// 256-bit SHA-2
    Sha256,
    /// 256-bit BLAKE3
    Blake3,
}

impl DigestAlgorithm {
    pub fn into_fingerprint(self) -> Arc<dyn Fingerprint> {
        Arc::new(self)
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Fingerprint for DigestAlgorithm {
    fn name(&self) -> &str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Blake3 => "blake3",
        }
    }

    fn fingerprint(&self, reader: &mut dyn Read) -> io::Result<String> {
        match self {
            DigestAlgorithm::Md5 => {
                let mut hasher = Md5::new();
                stream(reader, |chunk| hasher.update(chunk))?;
                Ok(format!("{:x}", hasher.finalize()))
            }
            DigestAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                stream(reader, |chunk| hasher.update(chunk))?;
                Ok(format!("{:x}", hasher.finalize()))
            }
            DigestAlgorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                stream(reader, |chunk| {
                    hasher.update(chunk);
                })?;
                Ok(hasher.finalize().to_hex().to_string())
            }
        }
    }
}

fn stream(reader: &mut dyn Read, mut update: impl FnMut(&[u8])) -> io::Result<()> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        update(&buffer[..n]);
    }
}
