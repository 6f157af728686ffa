//! Byte-length check run on raw frames before any parsing

/// True when a payload of `payload_bytes` is within `max_bytes`
#[inline]
pub fn check(payload_bytes: usize, max_bytes: usize) -> bool {
    payload_bytes <= max_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_boundaries() {
        assert!(check(0, 1024));
        assert!(check(1024, 1024));
        assert!(!check(1025, 1024));
        assert!(!check(2048, 1024));
    }
}
