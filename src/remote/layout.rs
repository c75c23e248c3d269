//! Remote namespace layout.
//!
//! ```text
//! <base_path>/<client_id>/
//!   .verification
//!   <YYYYMM>/
//!     full/<subvolume>_<YYYYMMDD-HHMMSS>.<compress-ext>.enc
//!     incremental/<subvolume>_<ts>__from_<parent_ts>.<compress-ext>.enc
//! ```

use crate::store::ArchiveKind;

/// Extension of the encryption layer; the compressor extension varies.
pub const CRYPT_EXT: &str = "enc";

pub fn month_dir(client_prefix: &str, month_bucket: &str) -> String {
    format!("{}/{}", client_prefix, month_bucket)
}

pub fn kind_dir(client_prefix: &str, month_bucket: &str, kind: ArchiveKind) -> String {
    format!("{}/{}/{}", client_prefix, month_bucket, kind.as_str())
}

pub fn archive_filename(
    subvolume: &str,
    snapshot_ts: &str,
    parent_ts: Option<&str>,
    compress_ext: &str,
) -> String {
    match parent_ts {
        Some(parent) => format!(
            "{}_{}__from_{}.{}.{}",
            subvolume, snapshot_ts, parent, compress_ext, CRYPT_EXT
        ),
        None => format!("{}_{}.{}.{}", subvolume, snapshot_ts, compress_ext, CRYPT_EXT),
    }
}

pub fn archive_path(
    client_prefix: &str,
    month_bucket: &str,
    kind: ArchiveKind,
    subvolume: &str,
    snapshot_ts: &str,
    parent_ts: Option<&str>,
    compress_ext: &str,
) -> String {
    format!(
        "{}/{}",
        kind_dir(client_prefix, month_bucket, kind),
        archive_filename(subvolume, snapshot_ts, parent_ts, compress_ext)
    )
}

pub fn verification_path(client_prefix: &str) -> String {
    format!("{}/.verification", client_prefix)
}

pub fn part_path(remote_path: &str) -> String {
    format!("{}.part", remote_path)
}

/// Compression extension recorded in an archive filename, if parseable.
pub fn compress_ext_of(filename: &str) -> Option<&str> {
    let stem = filename.strip_suffix(&format!(".{}", CRYPT_EXT))?;
    stem.rsplit('.').next()
}

/// True for `YYYYMM` names.
pub fn is_month_bucket(name: &str) -> bool {
    name.len() == 6 && name.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_archive_path() {
        let path = archive_path(
            "/mnt/backups/laptop",
            "202601",
            ArchiveKind::Full,
            "root",
            "20260101-020000",
            None,
            "zst",
        );
        assert_eq!(
            path,
            "/mnt/backups/laptop/202601/full/root_20260101-020000.zst.enc"
        );
    }

    #[test]
    fn test_incremental_archive_path() {
        let path = archive_path(
            "/mnt/backups/laptop",
            "202601",
            ArchiveKind::Incremental,
            "home",
            "20260102-020000",
            Some("20260101-020000"),
            "gz",
        );
        assert_eq!(
            path,
            "/mnt/backups/laptop/202601/incremental/home_20260102-020000__from_20260101-020000.gz.enc"
        );
    }

    #[test]
    fn test_part_and_verification_paths() {
        assert_eq!(part_path("/a/b.zst.enc"), "/a/b.zst.enc.part");
        assert_eq!(
            verification_path("/mnt/backups/laptop"),
            "/mnt/backups/laptop/.verification"
        );
    }

    #[test]
    fn test_compress_ext_of() {
        assert_eq!(
            compress_ext_of("root_20260101-020000.zst.enc"),
            Some("zst")
        );
        assert_eq!(
            compress_ext_of("home_20260102-020000__from_20260101-020000.gz.enc"),
            Some("gz")
        );
        assert_eq!(compress_ext_of("stray.txt"), None);
    }

    #[test]
    fn test_is_month_bucket() {
        assert!(is_month_bucket("202601"));
        assert!(!is_month_bucket("2026"));
        assert!(!is_month_bucket("full"));
    }
}
