use chrono::{DateTime, SubsecRound, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Timestamp type (UTC instant, microsecond resolution once inside a `Reading`).
pub type Timestamp = DateTime<Utc>;

/// Temperature value type (degrees Celsius).
pub type Temperature = f64;

/// Sensor name to temperature mapping carried by one reading.
pub type SensorValues = BTreeMap<String, Temperature>;

/// One inbound multi-sensor sample.
///
/// Built once from a decoded message and never mutated afterwards; consumers receive it by
/// reference. The timestamp is truncated to microseconds on construction so every backend
/// observes the same instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    values: SensorValues,
    timestamp: Timestamp,
    error_message: String,
}

impl Reading {
    pub fn new(values: SensorValues, timestamp: Timestamp, error_message: impl Into<String>) -> Self {
        Self {
            values,
            timestamp: timestamp.trunc_subsecs(6),
            error_message: error_message.into(),
        }
    }

    /// Convenience constructor from `(name, value)` pairs.
    pub fn from_pairs<N: Into<String>>(
        pairs: impl IntoIterator<Item = (N, Temperature)>,
        timestamp: Timestamp,
        error_message: impl Into<String>,
    ) -> Self {
        let values = pairs.into_iter().map(|(n, v)| (n.into(), v)).collect();
        Self::new(values, timestamp, error_message)
    }

    pub fn values(&self) -> &SensorValues {
        &self.values
    }

    pub fn value(&self, sensor: &str) -> Option<Temperature> {
        self.values.get(sensor).copied()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Error text reported by the device; `""` means no error.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn has_error(&self) -> bool {
        !self.error_message.is_empty()
    }
}

/// Per-sensor, time-ordered projection of several readings.
///
/// `temperatures` and `timestamps` are index-aligned; the only way to grow a series is
/// [`SensorSeries::push`], which appends to both.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSeries {
    name: String,
    temperatures: Vec<Temperature>,
    timestamps: Vec<Timestamp>,
}

impl SensorSeries {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temperatures: Vec::new(),
            timestamps: Vec::new(),
        }
    }

    /// Builds a series from `(temperature, timestamp)` pairs in the given order.
    pub fn from_points(
        name: impl Into<String>,
        points: impl IntoIterator<Item = (Temperature, Timestamp)>,
    ) -> Self {
        let mut s = Self::new(name);
        for (t, ts) in points {
            s.push(t, ts);
        }
        s
    }

    pub fn push(&mut self, temperature: Temperature, timestamp: Timestamp) {
        self.temperatures.push(temperature);
        self.timestamps.push(timestamp);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn temperatures(&self) -> &[Temperature] {
        &self.temperatures
    }

    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Result of a range read: one series per sensor seen in range, plus the distinct
/// non-empty error messages of the readings in range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub sensors: Vec<SensorSeries>,
    pub error_messages: BTreeSet<String>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty() && self.error_messages.is_empty()
    }

    pub fn series(&self, name: &str) -> Option<&SensorSeries> {
        self.sensors.iter().find(|s| s.name() == name)
    }
}

/// Pivots wide readings into per-sensor series.
///
/// Readings must be pushed in ascending timestamp order; each series keeps that order.
/// Series appear in order of first observation.
#[derive(Debug, Default)]
pub struct SeriesBuilder {
    sensors: Vec<SensorSeries>,
    index: HashMap<String, usize>,
    error_messages: BTreeSet<String>,
}

impl SeriesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reading(&mut self, reading: &Reading) {
        for (name, &value) in reading.values() {
            self.push_point(name, value, reading.timestamp());
        }
        if reading.has_error() {
            self.error_messages.insert(reading.error_message().to_string());
        }
    }

    fn push_point(&mut self, name: &str, value: Temperature, timestamp: Timestamp) {
        let idx = match self.index.get(name) {
            Some(&i) => i,
            None => {
                self.sensors.push(SensorSeries::new(name));
                let i = self.sensors.len() - 1;
                self.index.insert(name.to_string(), i);
                i
            }
        };
        self.sensors[idx].push(value, timestamp);
    }

    pub fn finish(self) -> QueryResult {
        QueryResult {
            sensors: self.sensors,
            error_messages: self.error_messages,
        }
    }
}

impl<'a> FromIterator<&'a Reading> for QueryResult {
    fn from_iter<I: IntoIterator<Item = &'a Reading>>(iter: I) -> Self {
        let mut b = SeriesBuilder::new();
        for r in iter {
            b.push_reading(r);
        }
        b.finish()
    }
}
