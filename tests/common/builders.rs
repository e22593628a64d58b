//! Test data builders for creating test objects

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thingflow::Sensor;

/// Sensor replaying a fixed list of samples
pub struct ScriptedSensor {
    id: String,
    samples: VecDeque<f64>,
    fail_with: Option<String>,
    sampled: Arc<AtomicUsize>,
}

impl ScriptedSensor {
    /// Number of `sample` calls so far, readable from any thread
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.sampled)
    }
}

impl Sensor for ScriptedSensor {
    fn sensor_id(&self) -> String {
        self.id.clone()
    }

    fn sample(&mut self) -> anyhow::Result<Option<f64>> {
        self.sampled.fetch_add(1, Ordering::SeqCst);
        match self.samples.pop_front() {
            Some(val) => Ok(Some(val)),
            None => match &self.fail_with {
                Some(msg) => Err(anyhow::anyhow!("{}", msg)),
                None => Ok(None),
            },
        }
    }
}

/// Builder for creating test sensors
pub struct SensorBuilder {
    id: String,
    samples: Vec<f64>,
    fail_with: Option<String>,
}

impl SensorBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            samples: Vec::new(),
            fail_with: None,
        }
    }

    pub fn samples(mut self, samples: &[f64]) -> Self {
        self.samples = samples.to_vec();
        self
    }

    /// Fail instead of ending once the samples run out
    pub fn fail_with(mut self, msg: &str) -> Self {
        self.fail_with = Some(msg.to_string());
        self
    }

    pub fn build(self) -> ScriptedSensor {
        ScriptedSensor {
            id: self.id,
            samples: self.samples.into(),
            fail_with: self.fail_with,
            sampled: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_builder() {
        let mut sensor = SensorBuilder::new("lux-1")
            .samples(&[1.0, 2.0])
            .fail_with("unplugged")
            .build();

        assert_eq!(sensor.sensor_id(), "lux-1");
        assert_eq!(sensor.sample().unwrap(), Some(1.0));
        assert_eq!(sensor.sample().unwrap(), Some(2.0));
        assert!(sensor.sample().is_err());
        assert_eq!(sensor.counter().load(Ordering::SeqCst), 3);
    }
}
