pub mod rpc;
pub mod telemetry;

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

pub const TARGET_TEMPERATURE_RANGE: RangeInclusive<i32> = 18..=30;
pub const AIR_FLOW_RANGE: RangeInclusive<i32> = 0..=100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Hvac,
    PowerMeter,
    WaterMeter,
}

impl DeviceKind {
    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Hvac => "hvac",
            DeviceKind::PowerMeter => "power",
            DeviceKind::WaterMeter => "water",
        }
    }

    pub fn default_telemetry_interval(self) -> Duration {
        match self {
            DeviceKind::Hvac | DeviceKind::PowerMeter => Duration::from_secs(5),
            DeviceKind::WaterMeter => Duration::from_secs(60),
        }
    }

    /// Fixed startup state for this kind of device.
    pub fn initial_state(self) -> DeviceState {
        match self {
            DeviceKind::Hvac => DeviceState::Hvac(HvacState::default()),
            DeviceKind::PowerMeter => DeviceState::PowerMeter(None),
            DeviceKind::WaterMeter => DeviceState::WaterMeter(None),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hvac" => Ok(DeviceKind::Hvac),
            "power" | "energy" | "power_meter" => Ok(DeviceKind::PowerMeter),
            "water" | "water_meter" => Ok(DeviceKind::WaterMeter),
            other => Err(format!(
                "Unknown DEVICE_KIND '{other}' (expected hvac, power or water)"
            )),
        }
    }
}

/// Controllable attributes of the HVAC unit. Serializes as its telemetry object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HvacState {
    pub enabled: bool,
    pub air_flow: i32,
    pub target_temperature: i32,
}

impl Default for HvacState {
    fn default() -> Self {
        Self {
            enabled: true,
            air_flow: 50,
            target_temperature: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerReadings {
    pub amperage: f64,
    pub energy: f64,
    pub frequency: f64,
    pub power: f64,
    pub voltage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaterReadings {
    pub voltage: f64,
    pub water: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Readings {
    Power(PowerReadings),
    Water(WaterReadings),
}

/// The agent's single mutable device record. Meter variants hold the
/// last sampled readings, `None` until the first telemetry tick.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceState {
    Hvac(HvacState),
    PowerMeter(Option<PowerReadings>),
    WaterMeter(Option<WaterReadings>),
}

/// Flat telemetry object. The field set is fixed per device kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryMessage {
    Hvac(HvacState),
    Power(PowerReadings),
    Water(WaterReadings),
}

/// Edits coming from the presentation side. Always clamped to bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEdit {
    ToggleEnabled,
    SetEnabled(bool),
    SetTargetTemperature(i32),
    SetAirFlow(i32),
}

impl DeviceState {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceState::Hvac(_) => DeviceKind::Hvac,
            DeviceState::PowerMeter(_) => DeviceKind::PowerMeter,
            DeviceState::WaterMeter(_) => DeviceKind::WaterMeter,
        }
    }

    pub fn hvac(&self) -> Option<&HvacState> {
        match self {
            DeviceState::Hvac(h) => Some(h),
            _ => None,
        }
    }

    pub fn hvac_mut(&mut self) -> Option<&mut HvacState> {
        match self {
            DeviceState::Hvac(h) => Some(h),
            _ => None,
        }
    }

    /// Build the telemetry for this snapshot. Meters sample fresh readings,
    /// which are also returned so the owner can record them.
    pub fn telemetry<R: Rng>(&self, rng: &mut R) -> (TelemetryMessage, Option<Readings>) {
        match self {
            DeviceState::Hvac(h) => (TelemetryMessage::Hvac(h.clone()), None),
            DeviceState::PowerMeter(_) => {
                let r = PowerReadings::sample(rng);
                (TelemetryMessage::Power(r.clone()), Some(Readings::Power(r)))
            }
            DeviceState::WaterMeter(_) => {
                let r = WaterReadings::sample(rng);
                (TelemetryMessage::Water(r.clone()), Some(Readings::Water(r)))
            }
        }
    }

    /// Record sampled readings. Returns false if they don't match this device.
    pub fn record(&mut self, readings: Readings) -> bool {
        match (self, readings) {
            (DeviceState::PowerMeter(slot), Readings::Power(r)) => {
                *slot = Some(r);
                true
            }
            (DeviceState::WaterMeter(slot), Readings::Water(r)) => {
                *slot = Some(r);
                true
            }
            _ => false,
        }
    }

    /// Apply a presentation edit. Returns whether anything changed.
    pub fn apply_local(&mut self, edit: LocalEdit) -> bool {
        let Some(h) = self.hvac_mut() else {
            return false;
        };
        let before = h.clone();
        match edit {
            LocalEdit::ToggleEnabled => h.enabled = !h.enabled,
            LocalEdit::SetEnabled(on) => h.enabled = on,
            LocalEdit::SetTargetTemperature(t) => {
                h.target_temperature = clamp(t, &TARGET_TEMPERATURE_RANGE)
            }
            LocalEdit::SetAirFlow(f) => h.air_flow = clamp(f, &AIR_FLOW_RANGE),
        }
        *h != before
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Hvac(h) => write!(
                f,
                "HVAC {} | target {} °C | air flow {}%",
                if h.enabled { "on" } else { "off" },
                h.target_temperature,
                h.air_flow
            ),
            DeviceState::PowerMeter(Some(r)) => write!(
                f,
                "{} A | {} kWh | {} Hz | {} W | {} V",
                r.amperage, r.energy, r.frequency, r.power, r.voltage
            ),
            DeviceState::WaterMeter(Some(r)) => write!(f, "{} V | {} gal", r.voltage, r.water),
            DeviceState::PowerMeter(None) | DeviceState::WaterMeter(None) => {
                f.write_str("no readings yet")
            }
        }
    }
}

impl PowerReadings {
    pub fn sample<R: Rng>(rng: &mut R) -> Self {
        Self {
            amperage: round_to(rng.gen_range(10.0..=20.0), 1),
            energy: round_to(rng.gen_range(500.0..=800.0), 1),
            frequency: round_to(rng.gen_range(49.0..=61.0), 1),
            power: round_to(rng.gen_range(1000.0..=3000.0), 1),
            voltage: round_to(rng.gen_range(210.0..=250.0), 1),
        }
    }
}

impl WaterReadings {
    pub fn sample<R: Rng>(rng: &mut R) -> Self {
        Self {
            voltage: round_to(rng.gen_range(3.5..=4.5), 2),
            water: round_to(rng.gen_range(0.5..=3.0), 2),
        }
    }
}

fn clamp(value: i32, range: &RangeInclusive<i32>) -> i32 {
    value.clamp(*range.start(), *range.end())
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::{Value, json};

    fn keys(msg: &TelemetryMessage) -> Vec<String> {
        match serde_json::to_value(msg).expect("serialize") {
            Value::Object(map) => map.keys().cloned().collect(),
            other => panic!("telemetry is not an object: {other}"),
        }
    }

    #[test]
    fn hvac_telemetry_matches_state() {
        let state = DeviceState::Hvac(HvacState {
            enabled: false,
            air_flow: 10,
            target_temperature: 24,
        });
        let mut rng = StdRng::seed_from_u64(1);
        let (msg, readings) = state.telemetry(&mut rng);
        assert!(readings.is_none());
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"enabled": false, "airFlow": 10, "targetTemperature": 24})
        );
    }

    #[test]
    fn telemetry_field_sets_are_fixed() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut sorted = |kind: DeviceKind| {
            let (msg, _) = kind.initial_state().telemetry(&mut rng);
            let mut k = keys(&msg);
            k.sort();
            k
        };
        assert_eq!(sorted(DeviceKind::Hvac), ["airFlow", "enabled", "targetTemperature"]);
        assert_eq!(
            sorted(DeviceKind::PowerMeter),
            ["amperage", "energy", "frequency", "power", "voltage"]
        );
        assert_eq!(sorted(DeviceKind::WaterMeter), ["voltage", "water"]);
    }

    #[test]
    fn sampled_readings_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let p = PowerReadings::sample(&mut rng);
            assert!((10.0..=20.0).contains(&p.amperage));
            assert!((49.0..=61.0).contains(&p.frequency));
            assert!((210.0..=250.0).contains(&p.voltage));
            let w = WaterReadings::sample(&mut rng);
            assert!((3.5..=4.5).contains(&w.voltage));
            assert!((0.5..=3.0).contains(&w.water));
        }
    }

    #[test]
    fn local_edits_are_clamped() {
        let mut state = DeviceKind::Hvac.initial_state();
        assert!(state.apply_local(LocalEdit::SetTargetTemperature(99)));
        assert!(state.apply_local(LocalEdit::SetAirFlow(-5)));
        let h = state.hvac().unwrap();
        assert_eq!(h.target_temperature, 30);
        assert_eq!(h.air_flow, 0);

        assert!(!state.apply_local(LocalEdit::SetAirFlow(0)));
        assert!(state.apply_local(LocalEdit::ToggleEnabled));
        assert!(!state.hvac().unwrap().enabled);
    }

    #[test]
    fn meters_ignore_local_edits_and_record_readings() {
        let mut state = DeviceKind::WaterMeter.initial_state();
        assert!(!state.apply_local(LocalEdit::ToggleEnabled));

        let r = WaterReadings {
            voltage: 4.0,
            water: 1.25,
        };
        assert!(!state.record(Readings::Power(PowerReadings {
            amperage: 1.0,
            energy: 1.0,
            frequency: 50.0,
            power: 1.0,
            voltage: 230.0,
        })));
        assert!(state.record(Readings::Water(r.clone())));
        assert_eq!(state, DeviceState::WaterMeter(Some(r)));
    }

    #[test]
    fn parses_device_kind() {
        assert_eq!("HVAC".parse::<DeviceKind>(), Ok(DeviceKind::Hvac));
        assert_eq!("energy".parse::<DeviceKind>(), Ok(DeviceKind::PowerMeter));
        assert_eq!("water".parse::<DeviceKind>(), Ok(DeviceKind::WaterMeter));
        assert!("toaster".parse::<DeviceKind>().is_err());
    }
}
