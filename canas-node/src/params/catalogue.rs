//! Known parameter definitions
//!
//! A definition fixes the data type of an identifier before the first frame
//! is seen, so a frame declaring anything else is rejected. Identifiers
//! without a definition lock their type on first observation instead.

use crate::codec::DataType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static description of one parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Message identifier
    pub id: u16,
    /// Short name used in configuration and logs
    pub name: String,
    /// The only data type accepted for this identifier
    pub datatype: DataType,
    /// Age after which the latest value is reported stale
    #[serde(default, rename = "stale_after_ms", with = "millis")]
    pub stale_after: Option<Duration>,
}

impl ParameterDefinition {
    /// Build a definition
    pub fn new(id: u16, name: &str, datatype: DataType) -> Self {
        Self {
            id,
            name: name.to_string(),
            datatype,
            stale_after: None,
        }
    }

    /// Set the staleness limit
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }
}

/// Parameters every node knows about
pub fn standard_catalogue() -> Vec<ParameterDefinition> {
    let air_data = Duration::from_millis(500);
    vec![
        ParameterDefinition::new(311, "pitch_angle", DataType::Float).with_stale_after(air_data),
        ParameterDefinition::new(312, "roll_angle", DataType::Float).with_stale_after(air_data),
        ParameterDefinition::new(315, "indicated_airspeed", DataType::Float)
            .with_stale_after(air_data),
        ParameterDefinition::new(316, "true_airspeed", DataType::Float).with_stale_after(air_data),
        ParameterDefinition::new(321, "heading_angle", DataType::Float).with_stale_after(air_data),
        ParameterDefinition::new(322, "standard_altitude", DataType::Float)
            .with_stale_after(air_data),
        ParameterDefinition::new(324, "altitude_rate", DataType::Float).with_stale_after(air_data),
        ParameterDefinition::new(333, "outside_air_temperature", DataType::Float)
            .with_stale_after(Duration::from_secs(5)),
        ParameterDefinition::new(1034, "qnh", DataType::UShort),
    ]
}

/// Look up a catalogue entry by name
pub fn find_by_name<'a>(
    definitions: &'a [ParameterDefinition],
    name: &str,
) -> Option<&'a ParameterDefinition> {
    definitions.iter().find(|d| d.name == name)
}

mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_ids_are_unique() {
        let catalogue = standard_catalogue();
        let mut ids: Vec<u16> = catalogue.iter().map(|d| d.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), catalogue.len());
    }

    #[test]
    fn test_qnh_definition() {
        let catalogue = standard_catalogue();
        let qnh = find_by_name(&catalogue, "qnh").unwrap();
        assert_eq!(qnh.id, 1034);
        assert_eq!(qnh.datatype, DataType::UShort);
        assert!(find_by_name(&catalogue, "nope").is_none());
    }
}
