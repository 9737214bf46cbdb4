use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Hex encoded SHA-256 of a file's content, read in 1MiB chunks.
pub async fn file_fingerprint(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hex encoded SHA-256 of values joined with `|`, each trimmed first.
/// Absent values hash as empty strings, so `None` and `Some("")` are the same.
///
/// Values are hashed as given. Dates and datetimes must be passed in ISO 8601
/// (`2024-01-31T00:00:00`, no offset for naive values) for keys to match the ones
/// written by the transform program.
pub fn hash_values<I, S>(values: I) -> String
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let canonical = values
        .into_iter()
        .map(|value| match value {
            Some(v) => v.as_ref().trim().to_owned(),
            None => String::new(),
        })
        .collect::<Vec<_>>()
        .join("|");

    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// The natural key of a business record: its identifying values plus the source system.
pub fn record_key<S: AsRef<str>>(key_values: &[Option<S>], source_system: &str) -> String {
    hash_values(
        key_values
            .iter()
            .map(|v| v.as_ref().map(AsRef::<str>::as_ref))
            .chain(std::iter::once(Some(source_system))),
    )
}

/// Fingerprint of a record's full business content, used to skip no-op writes.
/// Same hashing as `record_key`, over every business column instead of the key columns.
pub fn payload_fingerprint<S: AsRef<str>>(values: &[Option<S>], source_system: &str) -> String {
    record_key(values, source_system)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn test_file_fingerprint_matches_sha256_of_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let fingerprint = file_fingerprint(file.path()).await.unwrap();

        assert_eq!(
            fingerprint,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_file_fingerprint_of_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(file_fingerprint(&dir.path().join("missing.csv")).await.is_err());
    }

    #[test]
    fn test_hash_values_trims_and_treats_none_as_empty() {
        let a = hash_values([Some(" 10 "), None, Some("abc")]);
        let b = hash_values([Some("10"), Some(""), Some("abc")]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_payload_fingerprint_hashes_like_record_key() {
        let values = [Some("10"), Some("2024-01-31T00:00:00"), None];
        assert_eq!(
            payload_fingerprint(&values, "ExternalProvider"),
            hash_values([
                Some("10"),
                Some("2024-01-31T00:00:00"),
                Some(""),
                Some("ExternalProvider")
            ])
        );
    }

    #[test]
    fn test_record_key_depends_on_source_system() {
        let values = [Some("1"), Some("2")];
        assert_ne!(
            record_key(&values, "ExternalProvider"),
            record_key(&values, "Internal")
        );
        assert_eq!(
            record_key(&values, "ExternalProvider"),
            hash_values([Some("1"), Some("2"), Some("ExternalProvider")])
        );
    }
}
