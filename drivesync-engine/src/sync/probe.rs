use std::io;
use std::path::Path;

use time::OffsetDateTime;
use tokio::io::AsyncReadExt;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Metadata snapshot of a local file, as compared against tracked state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProbe {
    pub modified: i64,
    pub size: u64,
    pub checksum: String,
}

/// Stats a file and streams an md5 over its contents.
pub async fn probe_file(path: &Path) -> io::Result<FileProbe> {
    let meta = tokio::fs::metadata(path).await?;
    let modified = meta
        .modified()
        .map(|t| OffsetDateTime::from(t).unix_timestamp())
        .unwrap_or_else(|_| now_unix());
    let checksum = md5_of_file(path).await?;
    Ok(FileProbe {
        modified,
        size: meta.len(),
        checksum,
    })
}

pub async fn md5_of_file(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn md5_hex_matches_known_digest() {
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn probe_reports_size_and_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let probe = probe_file(&path).await.unwrap();
        assert_eq!(probe.size, 5);
        assert_eq!(probe.checksum, "5d41402abc4b2a76b9719d911017c592");
        assert!(probe.modified > 0);
    }

    #[tokio::test]
    async fn streamed_md5_matches_one_shot_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let payload = vec![7u8; HASH_BUF_SIZE * 2 + 13];
        tokio::fs::write(&path, &payload).await.unwrap();

        assert_eq!(md5_of_file(&path).await.unwrap(), md5_hex(&payload));
    }

    #[tokio::test]
    async fn probe_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(probe_file(&dir.path().join("absent")).await.is_err());
    }
}
