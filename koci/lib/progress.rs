//! Progress and byte stream types shared by transfers.

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::KociResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A lazy sequence of integer percent values in `[0, 100]`. Errors arrive
/// in-band as terminal items; a successful flow ends with `100`.
pub type ProgressStream = BoxStream<'static, KociResult<u64>>;

/// A lazy sequence of content chunks.
pub type ByteStream = BoxStream<'static, KociResult<Bytes>>;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Computes the whole percent of `bytes` out of `total`, clamped to 100.
/// Zero-byte content counts as complete.
pub fn percent(bytes: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    (bytes.saturating_mul(100) / total).min(100)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_floors_and_clamps() {
        assert_eq!(percent(0, 10), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(10, 10), 100);
        assert_eq!(percent(11, 10), 100);
        assert_eq!(percent(0, 0), 100);
    }
}
