//! B2500 balcony storage, first (`HMB`) and second (`HMA`) generation.
//!
//! Both generations share the runtime telegram (`cd=1`). The first
//! generation switches its two outputs through one bit field (`cd=4`); the
//! second generation replaces that with five scheduled output periods that
//! are always written together (`cd=7`).

use serde_json::{json, Value};

use hmbridge_core::{BridgeResult, StateMap};

use crate::commands::{
    choice_command, number_command, parse_bool, parse_in_range, parse_time, press_command,
    switch_command, sync_time_command,
};
use crate::dispatcher::CommandContext;
use crate::schema::{Advertisement, ChannelDefinition, DeviceSchema, FieldTransform, StatePath};
use crate::telegram::Telegram;

pub const DATA_REFRESH: &str = "cd=1";
pub const CELL_DATA_REFRESH: &str = "cd=13";
pub const CALIBRATION_REFRESH: &str = "cd=14";

const CMD_CHARGING_MODE: u32 = 3;
const CMD_OUTPUTS: u32 = 4;
const CMD_DISCHARGE_DEPTH: u32 = 5;
const CMD_BATTERY_THRESHOLD: u32 = 6;
const CMD_TIME_PERIODS: u32 = 7;
const CMD_SYNC_TIME: u32 = 8;
const CMD_RESTART: u32 = 10;
const CMD_FACTORY_RESET: u32 = 11;
const CMD_ADAPTIVE_MODE: u32 = 17;

pub const TIME_PERIODS: usize = 5;
const CELL_COUNT: usize = 14;

/// State keys of the bit-packed outputs, bit 0 first.
const OUTPUT_KEYS: [&str; 2] = ["output1", "output2"];

const CHARGING_MODES: &[(&str, u32)] = &[("pv2PassThrough", 0), ("chargeThenDischarge", 1)];
const CHARGING_MODE_NAMES: &[(&str, &str)] = &[("0", "pv2PassThrough"), ("1", "chargeThenDischarge")];

/// Shared runtime fields of both generations.
fn runtime_channel() -> ChannelDefinition {
    ChannelDefinition::new("data", DATA_REFRESH)
        .with_availability_control()
        .with_field("p1", "solar.input1.charging", FieldTransform::Boolean)
        .with_field("p2", "solar.input2.charging", FieldTransform::Boolean)
        .with_field("w1", "solar.input1.power", FieldTransform::Integer)
        .with_field("w2", "solar.input2.power", FieldTransform::Integer)
        .with_field("pe", "batteryPercentage", FieldTransform::Integer)
        .with_field("kn", "batteryCapacity", FieldTransform::Integer)
        .with_field("vv", "deviceVersion", FieldTransform::Integer)
        .with_field("cs", "chargingMode", FieldTransform::Lookup(CHARGING_MODE_NAMES))
        .with_field("do", "dischargeDepth", FieldTransform::Integer)
        .with_field("g1", "output.output1Power", FieldTransform::Integer)
        .with_field("g2", "output.output2Power", FieldTransform::Integer)
        .with_field("tl", "temperature.min", FieldTransform::Integer)
        .with_field("th", "temperature.max", FieldTransform::Integer)
        .with_field("b1", "extraBattery1Connected", FieldTransform::Boolean)
        .with_field("b2", "extraBattery2Connected", FieldTransform::Boolean)
        .with_advertisement(Advertisement::power("solar.input1.power", "Input 1 Power"))
        .with_advertisement(Advertisement::power("solar.input2.power", "Input 2 Power"))
        .with_advertisement(Advertisement::power("output.output1Power", "Output 1 Power"))
        .with_advertisement(Advertisement::power("output.output2Power", "Output 2 Power"))
        .with_advertisement(
            Advertisement::sensor("batteryPercentage", "Battery State of Charge")
                .with_unit("%")
                .with_device_class("battery")
                .with_state_class("measurement"),
        )
        .with_advertisement(
            Advertisement::sensor("batteryCapacity", "Battery Capacity")
                .with_unit("Wh")
                .with_device_class("energy_storage"),
        )
        .with_advertisement(
            Advertisement::sensor("temperature.max", "Temperature")
                .with_unit("°C")
                .with_device_class("temperature")
                .with_state_class("measurement"),
        )
        .with_advertisement(Advertisement::sensor("deviceVersion", "Firmware Version").with_icon("mdi:chip"))
        .with_advertisement(
            Advertisement::binary_sensor("extraBattery1Connected", "Extra Battery 1")
                .with_device_class("connectivity")
                .enabled_when(|state| state.contains_key("extraBattery1Connected")),
        )
        .with_advertisement(
            Advertisement::binary_sensor("extraBattery2Connected", "Extra Battery 2")
                .with_device_class("connectivity")
                .enabled_when(|state| state.contains_key("extraBattery2Connected")),
        )
        .with_advertisement(Advertisement::select(
            "chargingMode",
            "Charging Mode",
            "charging-mode",
            &["pv2PassThrough", "chargeThenDischarge"],
        ))
        .with_advertisement(
            Advertisement::number("dischargeDepth", "Discharge Depth", "discharge-depth", 0.0, 100.0)
                .with_unit("%"),
        )
        .with_advertisement(Advertisement::button("restart", "Restart"))
        .with_advertisement(Advertisement::button("factory-reset", "Factory Reset"))
        .with_command("charging-mode", choice_command(CMD_CHARGING_MODE, "md", CHARGING_MODES))
        .with_command("discharge-depth", number_command(CMD_DISCHARGE_DEPTH, "md", 0..=100))
        .with_command("restart", press_command(CMD_RESTART))
        .with_command("factory-reset", press_command(CMD_FACTORY_RESET))
}

/// Bit field of the outputs enabled in `state`.
fn output_bits(state: &StateMap) -> u32 {
    OUTPUT_KEYS
        .iter()
        .enumerate()
        .filter(|(_, key)| state.get(**key).and_then(Value::as_bool) == Some(true))
        .fold(0, |bits, (index, _)| bits | (1 << index))
}

/// Toggle one output while keeping the other one as last set.
fn output_command(index: usize) -> impl Fn(&mut CommandContext<'_>) -> BridgeResult<()> + Send + Sync + 'static {
    move |ctx| {
        let enabled = parse_bool(ctx.payload())?;
        let state = ctx.update(|_| {
            let mut patch = StateMap::new();
            patch.insert(OUTPUT_KEYS[index].to_string(), Value::Bool(enabled));
            patch
        })?;
        ctx.publish(Telegram::command(CMD_OUTPUTS).with("md", output_bits(&state)));
        Ok(())
    }
}

/// First generation B2500.
pub fn hmb_schema() -> BridgeResult<DeviceSchema> {
    let mut data = runtime_channel()
        .with_field("o1", "output1", FieldTransform::Boolean)
        .with_field("o2", "output2", FieldTransform::Boolean)
        .with_field("lv", "batteryOutputThreshold", FieldTransform::Integer)
        .with_default("output1", json!(false))
        .with_default("output2", json!(false))
        .with_command("output1", output_command(0))
        .with_command("output2", output_command(1))
        .with_command("battery-threshold", number_command(CMD_BATTERY_THRESHOLD, "md", 0..=800));
    for (index, key) in OUTPUT_KEYS.iter().enumerate() {
        data = data.with_advertisement(Advertisement::switch(
            *key,
            format!("Output {}", index + 1),
            *key,
        ));
    }
    data = data.with_advertisement(
        Advertisement::number(
            "batteryOutputThreshold",
            "Battery Output Threshold",
            "battery-threshold",
            0.0,
            800.0,
        )
        .with_unit("W"),
    );

    DeviceSchema::builder("HMB", "B2500 V1").channel(data).build()
}

/// Settings of one scheduled output period.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TimePeriod {
    enabled: bool,
    start: String,
    end: String,
    output: i64,
}

impl Default for TimePeriod {
    fn default() -> Self {
        Self {
            enabled: false,
            start: "00:00".to_string(),
            end: "23:59".to_string(),
            output: 800,
        }
    }
}

impl TimePeriod {
    fn root(n: usize) -> String {
        format!("timePeriod{}", n)
    }

    fn from_state(state: &StateMap, n: usize) -> Self {
        let defaults = Self::default();
        let path = |field: &str| StatePath::new(format!("{}.{}", Self::root(n), field));
        Self {
            enabled: path("enabled").get_bool(state).unwrap_or(defaults.enabled),
            start: path("startTime").get_str(state).map_or(defaults.start, str::to_string),
            end: path("endTime").get_str(state).map_or(defaults.end, str::to_string),
            output: path("outputValue").get_i64(state).unwrap_or(defaults.output),
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "enabled": self.enabled,
            "startTime": self.start,
            "endTime": self.end,
            "outputValue": self.output,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeriodField {
    Enabled,
    StartTime,
    EndTime,
    OutputValue,
}

/// A validated period setting.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PeriodValue {
    Enabled(bool),
    StartTime(String),
    EndTime(String),
    OutputValue(i64),
}

impl PeriodField {
    const ALL: [PeriodField; 4] = [Self::Enabled, Self::StartTime, Self::EndTime, Self::OutputValue];

    fn command(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::StartTime => "start-time",
            Self::EndTime => "end-time",
            Self::OutputValue => "output-value",
        }
    }

    fn parse(&self, payload: &str) -> BridgeResult<PeriodValue> {
        Ok(match self {
            Self::Enabled => PeriodValue::Enabled(parse_bool(payload)?),
            Self::StartTime => PeriodValue::StartTime(parse_time(payload)?),
            Self::EndTime => PeriodValue::EndTime(parse_time(payload)?),
            Self::OutputValue => PeriodValue::OutputValue(parse_in_range(payload, 80..=800)?),
        })
    }
}

impl PeriodValue {
    fn apply(self, period: &mut TimePeriod) {
        match self {
            Self::Enabled(enabled) => period.enabled = enabled,
            Self::StartTime(start) => period.start = start,
            Self::EndTime(end) => period.end = end,
            Self::OutputValue(output) => period.output = output,
        }
    }
}

/// Encode all periods: `cd=7,md=0,a1=..,b1=..,e1=..,v1=..,a2=..`.
fn time_periods_telegram(state: &StateMap) -> Telegram {
    let mut telegram = Telegram::command(CMD_TIME_PERIODS).with("md", 0);
    for n in 1..=TIME_PERIODS {
        let period = TimePeriod::from_state(state, n);
        telegram.push(&format!("a{}", n), u8::from(period.enabled));
        telegram.push(&format!("b{}", n), &period.start);
        telegram.push(&format!("e{}", n), &period.end);
        telegram.push(&format!("v{}", n), period.output);
    }
    telegram
}

/// Change one setting of period `n` and re-send all periods.
fn time_period_command(
    n: usize,
    field: PeriodField,
) -> impl Fn(&mut CommandContext<'_>) -> BridgeResult<()> + Send + Sync + 'static {
    move |ctx| {
        let value = field.parse(ctx.payload())?;
        let state = ctx.update(|current| {
            let mut period = TimePeriod::from_state(current, n);
            value.apply(&mut period);
            let mut patch = StateMap::new();
            patch.insert(TimePeriod::root(n), period.to_value());
            patch
        })?;
        ctx.publish(time_periods_telegram(&state));
        Ok(())
    }
}

fn cell_data_channel() -> ChannelDefinition {
    let mut channel = ChannelDefinition::new("cell-data", CELL_DATA_REFRESH)
        .with_marker("ce")
        .with_enabled(|options| options.cell_data)
        .with_field("ce", "cells.count", FieldTransform::Integer);
    for n in 1..=CELL_COUNT {
        let path = format!("cells.voltage{}", n);
        channel = channel
            .with_field(format!("c{}", n), path.as_str(), FieldTransform::Scaled(0.001))
            .with_advertisement(
                Advertisement::sensor(path.as_str(), format!("Cell {} Voltage", n))
                    .with_unit("V")
                    .with_device_class("voltage")
                    .with_state_class("measurement"),
            );
    }
    channel
}

fn calibration_channel() -> ChannelDefinition {
    ChannelDefinition::new("calibration-data", CALIBRATION_REFRESH)
        .with_marker("cl")
        .with_enabled(|options| options.calibration_data)
        .with_field("cl", "calibration.status", FieldTransform::Integer)
        .with_field("cc", "calibration.capacity", FieldTransform::Integer)
        .with_field("cr", "calibration.cycles", FieldTransform::Integer)
        .with_advertisement(Advertisement::sensor("calibration.status", "Calibration Status"))
        .with_advertisement(
            Advertisement::sensor("calibration.capacity", "Calibrated Capacity")
                .with_unit("Wh")
                .with_device_class("energy_storage"),
        )
        .with_advertisement(Advertisement::sensor("calibration.cycles", "Charge Cycles"))
}

/// Second generation B2500.
pub fn hma_schema() -> BridgeResult<DeviceSchema> {
    let mut data = runtime_channel()
        .with_field("am", "adaptiveMode", FieldTransform::Boolean)
        .with_advertisement(Advertisement::switch("adaptiveMode", "Adaptive Mode", "adaptive-mode"))
        .with_command("adaptive-mode", switch_command(CMD_ADAPTIVE_MODE, "md"))
        .with_command("sync-time", sync_time_command(CMD_SYNC_TIME));

    for n in 1..=TIME_PERIODS {
        let root = TimePeriod::root(n);
        data = data
            .with_field(format!("d{}", n), format!("{}.enabled", root), FieldTransform::Boolean)
            .with_field(format!("e{}", n), format!("{}.startTime", root), FieldTransform::Time)
            .with_field(format!("f{}", n), format!("{}.endTime", root), FieldTransform::Time)
            .with_field(format!("h{}", n), format!("{}.outputValue", root), FieldTransform::Integer)
            .with_default(root.as_str(), TimePeriod::default().to_value());

        for field in PeriodField::ALL {
            data = data.with_command(
                format!("time-period/{}/{}", n, field.command()),
                time_period_command(n, field),
            );
        }

        data = data
            .with_advertisement(Advertisement::switch(
                format!("{}.enabled", root),
                format!("Time Period {} Enabled", n),
                format!("time-period/{}/enabled", n),
            ))
            .with_advertisement(Advertisement::text(
                format!("{}.startTime", root),
                format!("Time Period {} Start", n),
                format!("time-period/{}/start-time", n),
            ))
            .with_advertisement(Advertisement::text(
                format!("{}.endTime", root),
                format!("Time Period {} End", n),
                format!("time-period/{}/end-time", n),
            ))
            .with_advertisement(
                Advertisement::number(
                    format!("{}.outputValue", root),
                    format!("Time Period {} Output", n),
                    format!("time-period/{}/output-value", n),
                    80.0,
                    800.0,
                )
                .with_unit("W"),
            );
    }

    DeviceSchema::builder("HMA", "B2500 V2")
        .channel(data)
        .channel(cell_data_channel())
        .channel(calibration_channel())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_bits() {
        let mut state = StateMap::new();
        assert_eq!(output_bits(&state), 0);
        state.insert("output2".into(), json!(true));
        assert_eq!(output_bits(&state), 2);
        state.insert("output1".into(), json!(true));
        assert_eq!(output_bits(&state), 3);
    }

    #[test]
    fn test_time_periods_default_encoding() {
        let telegram = time_periods_telegram(&StateMap::new());
        let encoded = telegram.to_string();
        assert!(encoded.starts_with("cd=7,md=0,a1=0,b1=00:00,e1=23:59,v1=800,a2=0"));
        assert!(encoded.ends_with("a5=0,b5=00:00,e5=23:59,v5=800"));
        assert_eq!(telegram.len(), 2 + 4 * TIME_PERIODS);
    }

    #[test]
    fn test_schemas_build() {
        let hmb = hmb_schema().unwrap();
        assert_eq!(hmb.channels.len(), 1);
        assert!(hmb.channel("data").unwrap().command("output1").is_some());

        let hma = hma_schema().unwrap();
        assert_eq!(hma.channels.len(), 3);
        let commands: Vec<&str> = hma.commands().map(|(_, c)| c.name.as_str()).collect();
        assert!(commands.contains(&"time-period/5/output-value"));
        assert!(commands.contains(&"sync-time"));
        assert!(!commands.contains(&"output1"));
    }

    #[test]
    fn test_runtime_decode() {
        let hma = hma_schema().unwrap();
        let telegram = Telegram::parse("p1=1,p2=0,w1=120,w2=0,pe=85,kn=2240,cs=1,do=90,d1=1,e1=6:0,f1=22:30,h1=300");
        let channel = hma.channel_for_telegram(&telegram).unwrap();
        assert_eq!(channel.key, "data");
        let patch = channel.decode(&telegram);
        assert_eq!(patch["solar"]["input1"], json!({"charging": true, "power": 120}));
        assert_eq!(patch["chargingMode"], json!("chargeThenDischarge"));
        assert_eq!(
            patch["timePeriod1"],
            json!({"enabled": true, "startTime": "06:00", "endTime": "22:30", "outputValue": 300})
        );
    }
}
