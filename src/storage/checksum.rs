// Checksum helpers: CRC32 for page images, CRC32C for WAL records.

/// Checksum a page image with the checksum field (bytes 20..24) zeroed.
pub fn page_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[..20]);
    hasher.update(&[0u8; 4]);
    hasher.update(&data[24..]);
    hasher.finalize()
}

/// CRC32C over a WAL record's framed bytes.
#[inline]
pub fn log_checksum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_checksum_ignores_checksum_field() {
        let mut a = vec![0u8; 4096];
        a[0] = 0x50;
        let mut b = a.clone();
        b[20] = 0xFF;
        b[21] = 0xEE;
        assert_eq!(page_checksum(&a), page_checksum(&b));
    }

    #[test]
    fn test_page_checksum_detects_body_change() {
        let a = vec![0u8; 4096];
        let mut b = a.clone();
        b[100] = 1;
        assert_ne!(page_checksum(&a), page_checksum(&b));
    }

    #[test]
    fn test_log_checksum_stable() {
        assert_eq!(log_checksum(b"hello"), log_checksum(b"hello"));
        assert_ne!(log_checksum(b"hello"), log_checksum(b"hellp"));
    }
}
