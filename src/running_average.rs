/// Incremental average whose sample count stops growing at `cap`.
///
/// Until the cap is reached this is the exact mean of all samples. After
/// that every new sample moves the value by `1 / cap` of the difference.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningAverage {
    value: f64,
    samples: u32,
    cap: u32,
}

impl RunningAverage {
    pub fn new(cap: u32) -> Self {
        Self {
            value: 0.0,
            samples: 0,
            cap: cap.max(1),
        }
    }

    /// Folds in a new sample and returns the updated average.
    pub fn add(&mut self, sample: f64) -> f64 {
        if self.samples < self.cap {
            self.samples += 1;
        }
        self.value += (sample - self.value) / f64::from(self.samples);
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }
}
