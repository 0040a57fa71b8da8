use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::config::RecorderConfig;

/// One resolved frame of a sample
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub file: String,
    pub line: i64,
}

impl Location {
    pub fn new(name: impl Into<String>, file: impl Into<String>, line: i64) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            line,
        }
    }

    /// Synthetic frame with an empty name, e.g. "In native code" or "Garbage Collection"
    pub fn placeholder(file: impl Into<String>) -> Self {
        Self::new("", file, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelValue {
    Num(u64),
    Str(String),
}

/// Key/value metadata attached to a sample
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub key: Cow<'static, str>,
    pub value: LabelValue,
}

impl Label {
    pub fn str(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key: Cow::Borrowed(key),
            value: LabelValue::Str(value.into()),
        }
    }

    pub fn num(key: &'static str, value: u64) -> Self {
        Self {
            key: Cow::Borrowed(key),
            value: LabelValue::Num(value),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            LabelValue::Str(value) => Some(value),
            LabelValue::Num(_) => None,
        }
    }

    pub fn as_num(&self) -> Option<u64> {
        match self.value {
            LabelValue::Num(value) => Some(value),
            LabelValue::Str(_) => None,
        }
    }
}

/// Metric values of a single sample, before layout into the recorder's enabled value types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleValues {
    pub cpu_time_ns: i64,
    pub cpu_or_wall_samples: i64,
    pub wall_time_ns: i64,
    pub alloc_samples: i64,
}

/// Type and unit of one recorded value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueType {
    #[serde(rename = "type")]
    pub type_name: Cow<'static, str>,
    pub unit: Cow<'static, str>,
}

impl ValueType {
    const fn new(type_name: &'static str, unit: &'static str) -> Self {
        Self {
            type_name: Cow::Borrowed(type_name),
            unit: Cow::Borrowed(unit),
        }
    }
}

pub const CPU_TIME: ValueType = ValueType::new("cpu-time", "nanoseconds");
pub const CPU_SAMPLES: ValueType = ValueType::new("cpu-samples", "count");
pub const WALL_TIME: ValueType = ValueType::new("wall-time", "nanoseconds");
pub const ALLOC_SAMPLES: ValueType = ValueType::new("alloc-samples", "count");

const ALL_VALUE_TYPES: usize = 4;
const CPU_TIME_INDEX: usize = 0;
const CPU_SAMPLES_INDEX: usize = 1;
const WALL_TIME_INDEX: usize = 2;
const ALLOC_SAMPLES_INDEX: usize = 3;

/// Which value types a recorder keeps, and where each one lands in a sample's value array.
///
/// With everything enabled the order is cpu-time, cpu-samples, wall-time, alloc-samples. Disabling
/// a type removes it from the layout; its values are dropped when a sample is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleTypes {
    enabled: Vec<ValueType>,
    position_for: [usize; ALL_VALUE_TYPES],
}

impl SampleTypes {
    pub fn new(config: &RecorderConfig) -> Self {
        if config.cpu_time_enabled && config.alloc_samples_enabled {
            return Self {
                enabled: vec![CPU_TIME, CPU_SAMPLES, WALL_TIME, ALLOC_SAMPLES],
                position_for: [0, 1, 2, 3],
            };
        }

        let mut enabled = vec![CPU_SAMPLES, WALL_TIME];
        let mut position_for = [0; ALL_VALUE_TYPES];
        position_for[CPU_SAMPLES_INDEX] = 0;
        position_for[WALL_TIME_INDEX] = 1;

        let mut next_disabled_pos = ALL_VALUE_TYPES - 1;

        if config.cpu_time_enabled {
            position_for[CPU_TIME_INDEX] = enabled.len();
            enabled.push(CPU_TIME);
        } else {
            position_for[CPU_TIME_INDEX] = next_disabled_pos;
            next_disabled_pos -= 1;
        }

        if config.alloc_samples_enabled {
            position_for[ALLOC_SAMPLES_INDEX] = enabled.len();
            enabled.push(ALLOC_SAMPLES);
        } else {
            position_for[ALLOC_SAMPLES_INDEX] = next_disabled_pos;
        }

        Self {
            enabled,
            position_for,
        }
    }

    pub fn enabled(&self) -> &[ValueType] {
        &self.enabled
    }

    /// Place `values` according to the enabled layout
    pub fn layout(&self, values: &SampleValues) -> Vec<i64> {
        let mut metric_values = [0i64; ALL_VALUE_TYPES];
        metric_values[self.position_for[CPU_TIME_INDEX]] = values.cpu_time_ns;
        metric_values[self.position_for[CPU_SAMPLES_INDEX]] = values.cpu_or_wall_samples;
        metric_values[self.position_for[WALL_TIME_INDEX]] = values.wall_time_ns;
        metric_values[self.position_for[ALLOC_SAMPLES_INDEX]] = values.alloc_samples;
        metric_values[..self.enabled.len()].to_vec()
    }
}
