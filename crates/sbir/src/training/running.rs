/// Weighted running mean over a stream of scalar observations.
///
/// Accumulates `sum(value * weight)` and `sum(weight)`; there is no decay or
/// removal, the mean only grows its history until [`reset`](Self::reset).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningAverage {
    sum: f64,
    count: f64,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observation with the given (possibly fractional) weight.
    ///
    /// A weight of zero leaves the current mean unchanged.
    pub fn update(&mut self, value: f64, weight: f64) {
        debug_assert!(weight >= 0.0, "negative weight {weight}");
        self.sum += value * weight;
        self.count += weight;
    }

    /// Add an observation with weight 1.
    pub fn update_one(&mut self, value: f64) {
        self.update(value, 1.0);
    }

    /// The weighted mean so far.
    ///
    /// Returns `None` while no weight has been accumulated: the mean is
    /// undefined (a division by zero) and the caller must not rely on a value.
    pub fn current(&self) -> Option<f64> {
        if self.count > 0.0 {
            Some(self.sum / self.count)
        } else {
            None
        }
    }

    /// Total accumulated weight.
    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
