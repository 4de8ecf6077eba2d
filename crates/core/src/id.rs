//! Strongly-typed master-data identifiers.
//!
//! Plant entities are keyed by the codes assigned in master data
//! (e.g. `F01`, `F01-L2`, `CNC-014`, `CNC-014-VIB`), not by generated UUIDs.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::PlantError;

/// Identifier of a factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactoryId(String);

/// Identifier of a production line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineId(String);

/// Identifier of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

/// Identifier of a sensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(String);

macro_rules! impl_code_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Wrap a master-data code.
            ///
            /// Use `FromStr` when the code comes from untrusted input; this
            /// constructor does not validate.
            pub fn new(code: impl Into<String>) -> Self {
                Self(code.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = PlantError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(PlantError::invalid_id(format!("{}: empty code", $name)));
                }
                if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
                    return Err(PlantError::invalid_id(format!(
                        "{}: '{}' contains whitespace",
                        $name, trimmed
                    )));
                }
                Ok(Self(trimmed.to_string()))
            }
        }
    };
}

impl_code_newtype!(FactoryId, "FactoryId");
impl_code_newtype!(LineId, "LineId");
impl_code_newtype!(MachineId, "MachineId");
impl_code_newtype!(SensorId, "SensorId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trims_and_rejects_blank_codes() {
        let id: MachineId = "  CNC-014 ".parse().unwrap();
        assert_eq!(id.as_str(), "CNC-014");

        assert!("".parse::<SensorId>().is_err());
        assert!("CNC 014".parse::<MachineId>().is_err());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = SensorId::new("CNC-014-VIB");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"CNC-014-VIB\"");
    }
}
