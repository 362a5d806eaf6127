mod settings;

pub use settings::{
    generate_default_config, load_cluster_spec, CloudInitSettings, HypervisorSettings,
    LoggingSettings, OrchestratorSettings, ReadinessSettings, Settings, SshSettings,
};

/// Serde adapter for durations written as (possibly fractional) seconds.
pub mod duration_secs {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(D::Error::custom(format!("invalid duration: {secs} seconds")));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
