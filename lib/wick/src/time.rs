use std::time::SystemTime;

/// Current unix timestamp in whole seconds.
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock predates the unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_current_era() {
        // 2017-07-14; anything earlier means a broken clock, not a bug here.
        assert!(timestamp_secs() > 1_500_000_000);
    }
}
