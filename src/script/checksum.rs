//! Checksum calculation for scripts

use sha2::{Digest, Sha256};

/// Hexadecimal SHA-256 of a script body
///
/// Stored in the version ledger so that edits to an already applied script can be detected.
pub fn calculate_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Whether a stored checksum still matches the current script body.
///
/// Rows written without a checksum always match.
pub fn checksum_matches(stored: Option<&str>, current: &str) -> bool {
    stored.map_or(true, |stored| stored == current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            calculate_checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_checksum_matches() {
        let current = calculate_checksum("SELECT 1;");
        assert!(checksum_matches(Some(&current), &current));
        assert!(checksum_matches(None, &current));
        assert!(!checksum_matches(Some("deadbeef"), &current));
    }
}
