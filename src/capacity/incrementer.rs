//! Built-in incrementers.

use super::{Incrementer, PolicyProperties};

/// Default policy: create while below the configured maximum.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxPoolSizeIncrementer;

impl Incrementer for MaxPoolSizeIncrementer {
    fn should_create(&self, current_size: usize, max_size: usize, _created_count: usize) -> bool {
        current_size < max_size
    }
}

/// Creates up to `size` connections per growth round.
#[derive(Debug, Clone, Copy)]
pub struct SizeIncrementer {
    size: usize,
}

impl SizeIncrementer {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub(crate) fn from_properties(props: &PolicyProperties<'_>) -> Self {
        props.warn_unrecognized(&["size"]);
        Self::new(props.parse::<usize>("size").unwrap_or(1))
    }
}

impl Default for SizeIncrementer {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Incrementer for SizeIncrementer {
    fn should_create(&self, current_size: usize, max_size: usize, created_count: usize) -> bool {
        created_count < self.size && current_size < max_size
    }
}

/// Creates until the pool holds `watermark` connections.
///
/// A negative watermark means "unset" and falls back to the max-size rule.
#[derive(Debug, Clone, Copy)]
pub struct WatermarkIncrementer {
    watermark: i64,
}

impl WatermarkIncrementer {
    pub fn new(watermark: i64) -> Self {
        Self { watermark }
    }

    pub(crate) fn from_properties(props: &PolicyProperties<'_>) -> Self {
        props.warn_unrecognized(&["watermark"]);
        Self::new(props.parse::<i64>("watermark").unwrap_or(-1))
    }

    pub fn watermark(&self) -> i64 {
        self.watermark
    }
}

impl Incrementer for WatermarkIncrementer {
    fn should_create(&self, current_size: usize, max_size: usize, created_count: usize) -> bool {
        if self.watermark < 0 {
            return MaxPoolSizeIncrementer.should_create(current_size, max_size, created_count);
        }
        (current_size as i64) < self.watermark
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_pool_size_boundary() {
        let inc = MaxPoolSizeIncrementer;
        assert!(inc.should_create(0, 1, 0));
        assert!(inc.should_create(19, 20, 0));
        assert!(!inc.should_create(20, 20, 0));
        assert!(!inc.should_create(0, 0, 0));
    }

    #[test]
    fn test_size_limits_round() {
        let inc = SizeIncrementer::new(3);
        assert!(inc.should_create(0, 10, 0));
        assert!(inc.should_create(2, 10, 2));
        assert!(!inc.should_create(3, 10, 3));
        assert!(!inc.should_create(10, 10, 0));
    }

    #[test]
    fn test_watermark_unset_falls_back() {
        let inc = WatermarkIncrementer::new(-1);
        assert!(inc.should_create(4, 5, 0));
        assert!(!inc.should_create(5, 5, 0));
    }

    #[test]
    fn test_watermark_stops_at_mark() {
        let inc = WatermarkIncrementer::new(3);
        assert!(inc.should_create(2, 20, 0));
        assert!(!inc.should_create(3, 20, 0));
    }
}
