use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::error::RecorderError;
use super::sample::{Label, LabelValue, Location, ValueType};

/// Label linking a sample to the root span of its trace
pub const LOCAL_ROOT_SPAN_ID_LABEL: &str = "local root span id";
/// Label added at serialization time for samples whose root span has a known endpoint
pub const TRACE_ENDPOINT_LABEL: &str = "trace endpoint";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SampleKey {
    locations: Vec<Location>,
    labels: Vec<Label>,
}

#[derive(Debug, Clone)]
struct TimelineSample {
    key: SampleKey,
    values: Vec<i64>,
    timestamp_ns: i64,
}

/// Aggregated samples for one collection window
#[derive(Debug)]
pub struct Profile {
    sample_types: Vec<ValueType>,
    start: SystemTime,
    aggregated: HashMap<SampleKey, Vec<i64>>,
    timeline: Vec<TimelineSample>,
    endpoints: HashMap<u64, String>,
}

impl Profile {
    pub fn new(sample_types: Vec<ValueType>, start: Option<SystemTime>) -> Self {
        Self {
            sample_types,
            start: start.unwrap_or_else(SystemTime::now),
            aggregated: HashMap::new(),
            timeline: Vec::new(),
            endpoints: HashMap::new(),
        }
    }

    /// Add a sample. Samples with a timestamp are kept individually; the rest are summed per
    /// distinct (stack, labels).
    pub fn add(
        &mut self,
        locations: &[Location],
        values: &[i64],
        labels: &[Label],
        end_timestamp_ns: Option<i64>,
    ) -> Result<(), RecorderError> {
        if values.len() != self.sample_types.len() {
            return Err(RecorderError::InvalidSample(format!(
                "expected {} values, got {}",
                self.sample_types.len(),
                values.len()
            )));
        }

        let key = SampleKey {
            locations: locations.to_vec(),
            labels: labels.to_vec(),
        };

        match end_timestamp_ns {
            Some(timestamp_ns) => self.timeline.push(TimelineSample {
                key,
                values: values.to_vec(),
                timestamp_ns,
            }),
            None => {
                let totals = self
                    .aggregated
                    .entry(key)
                    .or_insert_with(|| vec![0; values.len()]);
                for (total, value) in totals.iter_mut().zip(values) {
                    *total = total.saturating_add(*value);
                }
            }
        }
        Ok(())
    }

    pub fn set_endpoint(&mut self, local_root_span_id: u64, endpoint: impl Into<String>) {
        self.endpoints.insert(local_root_span_id, endpoint.into());
    }

    /// Drop all samples and endpoints and start a new window
    pub fn reset(&mut self, start: Option<SystemTime>) {
        self.aggregated.clear();
        self.timeline.clear();
        self.endpoints.clear();
        self.start = start.unwrap_or_else(SystemTime::now);
    }

    pub fn start(&self) -> SystemTime {
        self.start
    }

    /// Number of distinct entries that would be serialized
    pub fn sample_count(&self) -> usize {
        self.aggregated.len() + self.timeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }

    /// Encode the window ending at `end`, then reset for a new window starting now
    pub fn serialize(&mut self, end: SystemTime) -> Result<EncodedProfile, RecorderError> {
        let start = self.start;
        let snapshot = self.snapshot(end);
        let buffer = serde_json::to_vec(&snapshot)
            .map_err(|e| RecorderError::Serialization(e.to_string()))?;

        self.reset(None);
        Ok(EncodedProfile { start, end, buffer })
    }

    fn snapshot(&self, end: SystemTime) -> ProfileSnapshot {
        let mut samples = Vec::with_capacity(self.sample_count());

        for (key, values) in &self.aggregated {
            samples.push(self.serialized_sample(key, values, None));
        }
        for sample in &self.timeline {
            samples.push(self.serialized_sample(
                &sample.key,
                &sample.values,
                Some(sample.timestamp_ns),
            ));
        }

        ProfileSnapshot {
            sample_types: self.sample_types.clone(),
            start: self.start,
            end,
            samples,
        }
    }

    fn serialized_sample(
        &self,
        key: &SampleKey,
        values: &[i64],
        timestamp_ns: Option<i64>,
    ) -> SerializedSample {
        let mut labels = key.labels.clone();
        if let Some(endpoint) = self.endpoint_for(&key.labels) {
            labels.push(Label::str(TRACE_ENDPOINT_LABEL, endpoint));
        }

        SerializedSample {
            locations: key.locations.clone(),
            values: values.to_vec(),
            labels,
            timestamp_ns,
        }
    }

    fn endpoint_for(&self, labels: &[Label]) -> Option<&str> {
        labels
            .iter()
            .find(|label| label.key == LOCAL_ROOT_SPAN_ID_LABEL)
            .and_then(|label| match label.value {
                LabelValue::Num(id) => self.endpoints.get(&id),
                LabelValue::Str(_) => None,
            })
            .map(String::as_str)
    }
}

/// Encoded profile for one collection window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedProfile {
    pub start: SystemTime,
    pub end: SystemTime,
    pub buffer: Vec<u8>,
}

impl EncodedProfile {
    pub fn decode(&self) -> Result<ProfileSnapshot, RecorderError> {
        serde_json::from_slice(&self.buffer).map_err(|e| RecorderError::Serialization(e.to_string()))
    }
}

/// Wire representation of a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub sample_types: Vec<ValueType>,
    pub start: SystemTime,
    pub end: SystemTime,
    pub samples: Vec<SerializedSample>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedSample {
    pub locations: Vec<Location>,
    pub values: Vec<i64>,
    pub labels: Vec<Label>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ns: Option<i64>,
}

impl SerializedSample {
    pub fn label(&self, key: &str) -> Option<&Label> {
        self.labels.iter().find(|label| label.key == key)
    }
}
