use crate::measurement::{Field, Measurement};

/// Fixed capacity circular buffer of fused measurements, one per second.
#[derive(Debug, Clone)]
pub struct MeasurementStore {
    buffer: Vec<Measurement>,
    capacity: usize,
    /// Slot the next measurement is written to.
    cursor: usize,
}

impl MeasurementStore {
    /// Creates an empty store holding at most `capacity` measurements.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    /// Adds a measurement, replacing the oldest one once the buffer is full.
    pub fn push(&mut self, measurement: Measurement) {
        if self.buffer.len() < self.capacity {
            self.buffer.push(measurement);
        } else {
            self.buffer[self.cursor] = measurement;
        }
        self.cursor = (self.cursor + 1) % self.capacity;
    }

    /// Oldest to newest view over the stored measurements.
    pub fn chronological(&self) -> impl DoubleEndedIterator<Item = &Measurement> + '_ {
        // Until the buffer wraps, physical order is chronological order.
        let split = if self.buffer.len() < self.capacity {
            0
        } else {
            self.cursor
        };
        let (newest, oldest) = self.buffer.split_at(split);
        oldest.iter().chain(newest.iter())
    }

    pub fn latest(&self) -> Option<&Measurement> {
        self.chronological().next_back()
    }

    /// The last `count` values of `field`, oldest first.
    pub fn last_values(&self, field: Field, count: usize) -> Vec<f64> {
        let mut values: Vec<f64> = self
            .chronological()
            .rev()
            .take(count)
            .map(|m| m.get(field))
            .collect();
        values.reverse();
        values
    }

    /// Mean of `field` over the last `window` measurements, or over all of
    /// them when fewer are stored. 0 for an empty store.
    pub fn windowed_average(&self, field: Field, window: usize) -> f64 {
        let (sum, count) = self
            .chronological()
            .rev()
            .take(window)
            .fold((0.0, 0usize), |(sum, count), m| (sum + m.get(field), count + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Average of every field over the last `window` measurements.
    pub fn windowed_measurement(&self, window: usize) -> Measurement {
        Measurement {
            timestamp: self.latest().map(|m| m.timestamp).unwrap_or_default(),
            import: self.windowed_average(Field::Import, window),
            export: self.windowed_average(Field::Export, window),
            production: self.windowed_average(Field::Production, window),
            consumption: self.windowed_average(Field::Consumption, window),
        }
    }

    /// Number of measurements since `field` was last positive. Counts every
    /// stored measurement when it never was.
    pub fn seconds_since_last_positive(&self, field: Field) -> usize {
        self.chronological()
            .rev()
            .take_while(|m| m.get(field) <= 0.0)
            .count()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
