//! Built-in decrementers.

use std::time::Duration;

use super::{Decrementer, PolicyProperties};
use crate::pool::ConnectionListener;

/// Default policy: destroy listeners idle past `timeout`, never below min.
#[derive(Debug, Clone, Copy)]
pub struct TimedOutDecrementer {
    timeout: Duration,
}

impl TimedOutDecrementer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub(crate) fn from_properties(props: &PolicyProperties<'_>, default_timeout: Duration) -> Self {
        props.warn_unrecognized(&["timeout"]);
        let timeout = props
            .parse::<u64>("timeout")
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);
        Self::new(timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Decrementer for TimedOutDecrementer {
    fn should_destroy(
        &self,
        _listener: &ConnectionListener,
        idle: Duration,
        current_size: usize,
        min_size: usize,
        _destroyed_count: usize,
    ) -> bool {
        idle >= self.timeout && current_size > min_size
    }
}

/// Like [`TimedOutDecrementer`] but destroys at most one listener per round,
/// the one validated longest ago.
#[derive(Debug, Clone, Copy)]
pub struct TimedOutFifoDecrementer {
    timeout: Duration,
}

impl TimedOutFifoDecrementer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub(crate) fn from_properties(props: &PolicyProperties<'_>, default_timeout: Duration) -> Self {
        let inner = TimedOutDecrementer::from_properties(props, default_timeout);
        Self::new(inner.timeout())
    }
}

impl Decrementer for TimedOutFifoDecrementer {
    fn should_destroy(
        &self,
        _listener: &ConnectionListener,
        idle: Duration,
        current_size: usize,
        min_size: usize,
        destroyed_count: usize,
    ) -> bool {
        destroyed_count == 0 && idle >= self.timeout && current_size > min_size
    }
}

/// Shrinks straight back to the minimum, regardless of idle time.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinPoolSizeDecrementer;

impl Decrementer for MinPoolSizeDecrementer {
    fn should_destroy(
        &self,
        _listener: &ConnectionListener,
        _idle: Duration,
        current_size: usize,
        min_size: usize,
        _destroyed_count: usize,
    ) -> bool {
        current_size > min_size
    }
}

/// Destroys up to `size` idle listeners per round, never below min.
#[derive(Debug, Clone, Copy)]
pub struct SizeDecrementer {
    size: usize,
}

impl SizeDecrementer {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub(crate) fn from_properties(props: &PolicyProperties<'_>) -> Self {
        props.warn_unrecognized(&["size"]);
        Self::new(props.parse::<usize>("size").unwrap_or(1))
    }
}

impl Decrementer for SizeDecrementer {
    fn should_destroy(
        &self,
        _listener: &ConnectionListener,
        _idle: Duration,
        current_size: usize,
        min_size: usize,
        destroyed_count: usize,
    ) -> bool {
        destroyed_count < self.size && current_size > min_size
    }
}

/// Shrinks down to `watermark` listeners, or to min when the watermark is
/// unset (negative).
#[derive(Debug, Clone, Copy)]
pub struct WatermarkDecrementer {
    watermark: i64,
}

impl WatermarkDecrementer {
    pub fn new(watermark: i64) -> Self {
        Self { watermark }
    }

    pub(crate) fn from_properties(props: &PolicyProperties<'_>) -> Self {
        props.warn_unrecognized(&["watermark"]);
        Self::new(props.parse::<i64>("watermark").unwrap_or(-1))
    }
}

impl Decrementer for WatermarkDecrementer {
    fn should_destroy(
        &self,
        _listener: &ConnectionListener,
        _idle: Duration,
        current_size: usize,
        min_size: usize,
        _destroyed_count: usize,
    ) -> bool {
        if self.watermark < 0 {
            current_size > min_size
        } else {
            current_size as i64 > self.watermark
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;
    use crate::resource::memory::MemoryConnectionFactory;
    use crate::resource::ManagedConnectionFactory;
    use std::sync::Arc;

    fn listener() -> Arc<ConnectionListener> {
        let factory = MemoryConnectionFactory::new();
        let connection = factory
            .create_managed_connection(&Credential::anonymous())
            .expect("memory connection");
        ConnectionListener::standalone(connection, Credential::anonymous())
    }

    #[test]
    fn test_timed_out_respects_min() {
        let dec = TimedOutDecrementer::new(Duration::from_secs(60));
        let l = listener();
        assert!(dec.should_destroy(&l, Duration::from_secs(61), 3, 1, 0));
        assert!(!dec.should_destroy(&l, Duration::from_secs(59), 3, 1, 0));
        assert!(!dec.should_destroy(&l, Duration::from_secs(120), 1, 1, 0));
    }

    #[test]
    fn test_fifo_only_one_per_round() {
        let dec = TimedOutFifoDecrementer::new(Duration::ZERO);
        let l = listener();
        assert!(dec.should_destroy(&l, Duration::ZERO, 5, 0, 0));
        assert!(!dec.should_destroy(&l, Duration::ZERO, 4, 0, 1));
    }

    #[test]
    fn test_size_caps_destroyed_per_round() {
        let dec = SizeDecrementer::new(2);
        let l = listener();
        assert!(dec.should_destroy(&l, Duration::ZERO, 10, 0, 1));
        assert!(!dec.should_destroy(&l, Duration::ZERO, 9, 0, 2));
    }

    #[test]
    fn test_watermark_sequence_keeps_two() {
        let dec = WatermarkDecrementer::new(2);
        let l = listener();
        let mut current = 5;
        let mut destroyed = 0;
        for _ in 0..5 {
            if dec.should_destroy(&l, Duration::ZERO, current, 0, destroyed) {
                current -= 1;
                destroyed += 1;
            }
        }
        assert_eq!(destroyed, 3);
        assert_eq!(current, 2);
    }

    #[test]
    fn test_watermark_unset_uses_min() {
        let dec = WatermarkDecrementer::new(-1);
        let l = listener();
        assert!(dec.should_destroy(&l, Duration::ZERO, 3, 2, 0));
        assert!(!dec.should_destroy(&l, Duration::ZERO, 2, 2, 0));
    }
}
