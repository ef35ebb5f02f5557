//! Artifact file classification and hashing
//!
//! Downloaded files are either binary artifacts, recognized by a known
//! package suffix, or `<name>.meta` metadata files. Content identity is a
//! SHA-256 digest over the file, used both for cache ids and for verifying
//! materialized cache slots.

use crate::error::{KilnError, KilnResult};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

/// Package suffixes treated as binary artifacts
pub const KNOWN_BIN_SUFFIXES: &[&str] =
    &[".rpm", ".deb", ".pkg.tar.gz", ".pkg.tar.xz", ".pkg.tar.zst"];

/// Split a binary artifact filename into its stem, if it carries a known
/// package suffix.
pub fn bin_stem(name: &str) -> Option<&str> {
    KNOWN_BIN_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
}

/// The stem of a `<name>.meta` metadata file.
pub fn meta_stem(name: &str) -> Option<&str> {
    name.strip_suffix(".meta")
}

/// The metadata filename that sits beside a binary artifact.
pub fn meta_file_name(bin_file_name: &str) -> String {
    match bin_stem(bin_file_name) {
        Some(stem) => format!("{}.meta", stem),
        None => format!("{}.meta", bin_file_name),
    }
}

/// SHA-256 content hash of a file, lowercase hex.
pub fn content_hash(path: &Path) -> KilnResult<String> {
    let mut file = File::open(path)
        .map_err(|e| KilnError::io(format!("opening {} for hashing", path.display()), e))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| KilnError::io(format!("hashing {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hard link `src` to `dst`, falling back to a full copy when linking is
/// not possible (e.g. across filesystems). Any existing `dst` is replaced.
pub fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    let _ = fs::remove_file(dst);

    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }

    match fs::copy(src, dst) {
        Ok(_) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(dst);
            Err(e)
        }
    }
}

/// Whether a file is missing or empty.
pub fn is_empty_file(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(m) => m.len() == 0,
        Err(_) => true,
    }
}

/// File size in bytes, zero when unreadable.
pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
