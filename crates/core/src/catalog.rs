//! Read-only catalog of plant entities.
//!
//! The catalog is built once at startup from master data and shared by every
//! simulation worker behind an `Arc`. Nothing in here is mutated afterwards.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{PlantError, PlantResult};
use crate::id::{FactoryId, LineId, MachineId, SensorId};
use crate::record::{ThresholdFlags, ThresholdStatus};
use crate::sensor::{MachineKind, SensorKind};

/// Operating limits of a sensor.
///
/// Ordering: `critical_low <= warning_low <= normal_min < normal_max <=
/// warning_high <= critical_high`. A value is "above warning" when it is
/// strictly greater than `warning_high` (and symmetrically for the other
/// limits).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "ThresholdsInput")]
pub struct Thresholds {
    pub normal_min: f64,
    pub normal_max: f64,
    pub warning_low: f64,
    pub warning_high: f64,
    pub critical_low: f64,
    pub critical_high: f64,
}

/// Master-data shape: the low-side limits are optional (many sensors only
/// alarm on the high side).
#[derive(Debug, Deserialize)]
struct ThresholdsInput {
    normal_min: f64,
    normal_max: f64,
    warning_low: Option<f64>,
    warning_high: f64,
    critical_low: Option<f64>,
    critical_high: f64,
}

impl From<ThresholdsInput> for Thresholds {
    fn from(input: ThresholdsInput) -> Self {
        let warning_low = input.warning_low.unwrap_or(input.normal_min);
        Self {
            normal_min: input.normal_min,
            normal_max: input.normal_max,
            warning_low,
            warning_high: input.warning_high,
            critical_low: input.critical_low.unwrap_or(warning_low),
            critical_high: input.critical_high,
        }
    }
}

impl Thresholds {
    pub fn validate(&self, entity: &str) -> PlantResult<()> {
        let values = [
            self.critical_low,
            self.warning_low,
            self.normal_min,
            self.normal_max,
            self.warning_high,
            self.critical_high,
        ];
        let invalid = |reason: &str| PlantError::InvalidThresholds {
            entity: entity.to_string(),
            reason: reason.to_string(),
        };

        if values.iter().any(|v| !v.is_finite()) {
            return Err(invalid("limits must be finite"));
        }
        if self.normal_min >= self.normal_max {
            return Err(invalid("normal_min must be below normal_max"));
        }
        if !values.windows(2).all(|w| w[0] <= w[1]) {
            return Err(invalid(
                "expected critical_low <= warning_low <= normal_min < normal_max <= warning_high <= critical_high",
            ));
        }
        if self.critical_high <= self.warning_high && self.critical_low >= self.warning_low {
            return Err(invalid("at least one critical limit must lie beyond its warning limit"));
        }
        Ok(())
    }

    pub fn normal_span(&self) -> f64 {
        self.normal_max - self.normal_min
    }

    pub fn normal_mid(&self) -> f64 {
        (self.normal_min + self.normal_max) / 2.0
    }

    pub fn flags(&self, value: f64) -> ThresholdFlags {
        ThresholdFlags {
            below_warning: value < self.warning_low,
            above_warning: value > self.warning_high,
            below_critical: value < self.critical_low,
            above_critical: value > self.critical_high,
        }
    }

    pub fn status(&self, value: f64) -> ThresholdStatus {
        self.flags(value).status()
    }
}

/// A factory (top of the hierarchy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factory {
    pub id: FactoryId,
    #[serde(default)]
    pub name: String,
}

/// A production line inside a factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: LineId,
    pub factory_id: FactoryId,
    #[serde(default)]
    pub name: String,
}

/// A machine on a production line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Machine {
    pub id: MachineId,
    pub line_id: LineId,
    pub factory_id: FactoryId,
    pub kind: MachineKind,
    pub name: String,
    pub ideal_cycle_secs: f64,
}

/// A sensor fitted to a machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub id: SensorId,
    pub machine_id: MachineId,
    pub line_id: LineId,
    pub factory_id: FactoryId,
    pub kind: SensorKind,
    pub unit: String,
    pub thresholds: Thresholds,
    pub sampling_interval_secs: u64,
}

impl Entity for Factory {
    type Id = FactoryId;
    const KIND: &'static str = "factory";

    fn id(&self) -> &FactoryId {
        &self.id
    }
}

impl Entity for Line {
    type Id = LineId;
    const KIND: &'static str = "line";

    fn id(&self) -> &LineId {
        &self.id
    }
}

impl Entity for Machine {
    type Id = MachineId;
    const KIND: &'static str = "machine";

    fn id(&self) -> &MachineId {
        &self.id
    }
}

impl Entity for Sensor {
    type Id = SensorId;
    const KIND: &'static str = "sensor";

    fn id(&self) -> &SensorId {
        &self.id
    }
}

/// Machine as it appears in master data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub id: MachineId,
    pub line_id: LineId,
    pub kind: MachineKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ideal_cycle_secs: Option<f64>,
}

/// Sensor as it appears in master data; omitted fields fall back to the
/// sensor-kind profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub id: SensorId,
    pub machine_id: MachineId,
    pub kind: SensorKind,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub thresholds: Option<Thresholds>,
    #[serde(default)]
    pub sampling_interval_secs: Option<u64>,
}

/// Serialized master-data snapshot (JSON catalog file or database rows).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub factories: Vec<Factory>,
    #[serde(default)]
    pub lines: Vec<Line>,
    #[serde(default)]
    pub machines: Vec<MachineSpec>,
    #[serde(default)]
    pub sensors: Vec<SensorSpec>,
}

impl CatalogDocument {
    /// Synthetic plant for development: `factories × lines × machines`, each
    /// machine fitted with its kind's default sensors.
    pub fn demo(factories: usize, lines_per_factory: usize, machines_per_line: usize) -> Self {
        let mut doc = CatalogDocument::default();
        let mut serial = 0usize;

        for f in 1..=factories {
            let factory_id = FactoryId::new(format!("F{f:02}"));
            doc.factories.push(Factory {
                id: factory_id.clone(),
                name: format!("Plant {f:02}"),
            });

            for l in 1..=lines_per_factory {
                let line_id = LineId::new(format!("{factory_id}-L{l}"));
                doc.lines.push(Line {
                    id: line_id.clone(),
                    factory_id: factory_id.clone(),
                    name: format!("Line {l}"),
                });

                for _ in 0..machines_per_line {
                    serial += 1;
                    let kind = MachineKind::ALL[serial % MachineKind::ALL.len()];
                    let machine_id = MachineId::new(format!("{}-{serial:03}", kind.code()));
                    doc.machines.push(MachineSpec {
                        id: machine_id.clone(),
                        line_id: line_id.clone(),
                        kind,
                        name: format!("{} #{serial}", kind.as_str()),
                        ideal_cycle_secs: None,
                    });

                    for sensor_kind in kind.profile().default_sensors {
                        doc.sensors.push(SensorSpec {
                            id: SensorId::new(format!("{machine_id}-{}", sensor_kind.code())),
                            machine_id: machine_id.clone(),
                            kind: *sensor_kind,
                            unit: None,
                            thresholds: None,
                            sampling_interval_secs: None,
                        });
                    }
                }
            }
        }

        doc
    }
}

/// Immutable index of the plant hierarchy.
#[derive(Debug, Clone, Default)]
pub struct EntityCatalog {
    factories: BTreeMap<FactoryId, Factory>,
    lines: BTreeMap<LineId, Line>,
    machines: BTreeMap<MachineId, Machine>,
    sensors: BTreeMap<SensorId, Sensor>,
    sensors_by_machine: BTreeMap<MachineId, Vec<SensorId>>,
}

fn insert_unique<E: Entity>(
    map: &mut BTreeMap<E::Id, E>,
    entity: E,
) -> PlantResult<()>
where
    E::Id: Ord,
{
    let id = entity.id().clone();
    if map.contains_key(&id) {
        return Err(PlantError::duplicate(E::KIND, id.to_string()));
    }
    map.insert(id, entity);
    Ok(())
}

impl EntityCatalog {
    /// Resolve and validate a master-data snapshot.
    ///
    /// Fails on duplicate ids, dangling parent references, invalid thresholds
    /// or a zero sampling interval.
    pub fn from_document(doc: CatalogDocument) -> PlantResult<Self> {
        let mut catalog = EntityCatalog::default();

        for factory in doc.factories {
            insert_unique(&mut catalog.factories, factory)?;
        }

        for line in doc.lines {
            if !catalog.factories.contains_key(&line.factory_id) {
                return Err(PlantError::unknown("factory", line.factory_id.to_string()));
            }
            insert_unique(&mut catalog.lines, line)?;
        }

        for spec in doc.machines {
            let line = catalog
                .lines
                .get(&spec.line_id)
                .ok_or_else(|| PlantError::unknown("line", spec.line_id.to_string()))?;
            let ideal_cycle_secs = spec
                .ideal_cycle_secs
                .unwrap_or_else(|| spec.kind.profile().ideal_cycle_secs);
            if !(ideal_cycle_secs.is_finite() && ideal_cycle_secs > 0.0) {
                return Err(PlantError::validation(format!(
                    "machine {}: ideal_cycle_secs must be positive",
                    spec.id
                )));
            }
            let machine = Machine {
                name: if spec.name.is_empty() { spec.id.to_string() } else { spec.name },
                factory_id: line.factory_id.clone(),
                id: spec.id,
                line_id: spec.line_id,
                kind: spec.kind,
                ideal_cycle_secs,
            };
            catalog.sensors_by_machine.entry(machine.id.clone()).or_default();
            insert_unique(&mut catalog.machines, machine)?;
        }

        for spec in doc.sensors {
            let machine = catalog
                .machines
                .get(&spec.machine_id)
                .ok_or_else(|| PlantError::unknown("machine", spec.machine_id.to_string()))?;
            let profile = spec.kind.profile();
            let thresholds = spec.thresholds.unwrap_or(profile.thresholds);
            thresholds.validate(spec.id.as_str())?;

            let sampling_interval_secs = spec.sampling_interval_secs.unwrap_or(profile.sampling_secs);
            if sampling_interval_secs == 0 {
                return Err(PlantError::validation(format!(
                    "sensor {}: sampling interval must be at least one second",
                    spec.id
                )));
            }

            let sensor = Sensor {
                line_id: machine.line_id.clone(),
                factory_id: machine.factory_id.clone(),
                unit: spec.unit.unwrap_or_else(|| profile.unit.to_string()),
                id: spec.id,
                machine_id: spec.machine_id,
                kind: spec.kind,
                thresholds,
                sampling_interval_secs,
            };
            catalog
                .sensors_by_machine
                .entry(sensor.machine_id.clone())
                .or_default()
                .push(sensor.id.clone());
            insert_unique(&mut catalog.sensors, sensor)?;
        }

        Ok(catalog)
    }

    pub fn factory(&self, id: &FactoryId) -> Option<&Factory> {
        self.factories.get(id)
    }

    pub fn line(&self, id: &LineId) -> Option<&Line> {
        self.lines.get(id)
    }

    pub fn machine(&self, id: &MachineId) -> Option<&Machine> {
        self.machines.get(id)
    }

    pub fn sensor(&self, id: &SensorId) -> Option<&Sensor> {
        self.sensors.get(id)
    }

    /// Machines in id order.
    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    /// Sensors fitted to a machine, in declaration order.
    pub fn sensors_of<'a>(&'a self, machine: &MachineId) -> impl Iterator<Item = &'a Sensor> + 'a {
        self.sensors_by_machine
            .get(machine)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sensors.get(id))
    }

    /// Distinct sensor kinds fitted to a machine.
    pub fn sensor_kinds_of(&self, machine: &MachineId) -> BTreeSet<SensorKind> {
        self.sensors_of(machine).map(|s| s.kind).collect()
    }

    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}
