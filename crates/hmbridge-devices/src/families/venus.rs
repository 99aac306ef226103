//! Venus AC-coupled storage (`HMG`).
//!
//! Venus firmware addresses current-epoch topics by the obfuscated device id.
//! Telegram keys use the `xxx_y` form.

use std::time::Duration;

use hmbridge_core::BridgeResult;

use crate::commands::{choice_command, number_command, press_command, switch_command, sync_time_command};
use crate::schema::{Advertisement, ChannelDefinition, DeviceSchema, FieldTransform};

pub const DATA_REFRESH: &str = "cd=1";
pub const BATTERY_REFRESH: &str = "cd=14";

const CMD_WORKING_MODE: u32 = 2;
const CMD_SYNC_TIME: u32 = 4;
const CMD_RESTART: u32 = 10;
const CMD_BACKUP_MODE: u32 = 11;
const CMD_MAX_CHARGING_POWER: u32 = 15;
const CMD_MAX_DISCHARGE_POWER: u32 = 16;

const BATTERY_POLL_INTERVAL: Duration = Duration::from_secs(300);

const WORKING_MODES: &[(&str, u32)] = &[("automatic", 0), ("manual", 1), ("trading", 2)];
const WORKING_MODE_NAMES: &[(&str, &str)] = &[("0", "automatic"), ("1", "manual"), ("2", "trading")];

fn data_channel() -> ChannelDefinition {
    ChannelDefinition::new("data", DATA_REFRESH)
        .with_availability_control()
        .with_field("cel_c", "batteryPercentage", FieldTransform::Integer)
        .with_field("cel_p", "batteryPower", FieldTransform::Integer)
        .with_field("tot_i", "energy.totalCharged", FieldTransform::Scaled(0.01))
        .with_field("tot_o", "energy.totalDischarged", FieldTransform::Scaled(0.01))
        .with_field("ele_d", "energy.dailyCharged", FieldTransform::Scaled(0.01))
        .with_field("ele_m", "energy.monthlyCharged", FieldTransform::Scaled(0.01))
        .with_field("grd_o", "gridOutputPower", FieldTransform::Integer)
        .with_field("wor_m", "workingMode", FieldTransform::Lookup(WORKING_MODE_NAMES))
        .with_field("bac_u", "backupMode", FieldTransform::Boolean)
        .with_field("mcp_w", "maxChargingPower", FieldTransform::Integer)
        .with_field("mdp_w", "maxDischargePower", FieldTransform::Integer)
        .with_field("dev_n", "deviceVersion", FieldTransform::Integer)
        .with_field("err_t", "errorCode", FieldTransform::Integer)
        .with_advertisement(
            Advertisement::sensor("batteryPercentage", "Battery State of Charge")
                .with_unit("%")
                .with_device_class("battery")
                .with_state_class("measurement"),
        )
        .with_advertisement(Advertisement::power("batteryPower", "Battery Power"))
        .with_advertisement(Advertisement::power("gridOutputPower", "Grid Output Power"))
        .with_advertisement(
            Advertisement::sensor("energy.totalCharged", "Total Charged")
                .with_unit("kWh")
                .with_device_class("energy")
                .with_state_class("total_increasing"),
        )
        .with_advertisement(
            Advertisement::sensor("energy.totalDischarged", "Total Discharged")
                .with_unit("kWh")
                .with_device_class("energy")
                .with_state_class("total_increasing"),
        )
        .with_advertisement(
            Advertisement::sensor("energy.dailyCharged", "Daily Charged")
                .with_unit("kWh")
                .with_device_class("energy")
                .with_state_class("total_increasing"),
        )
        .with_advertisement(Advertisement::sensor("deviceVersion", "Firmware Version").with_icon("mdi:chip"))
        .with_advertisement(
            Advertisement::sensor("errorCode", "Error Code")
                .with_icon("mdi:alert-circle")
                .enabled_when(|state| state.get("errorCode").and_then(|v| v.as_i64()).is_some_and(|c| c != 0)),
        )
        .with_advertisement(Advertisement::select(
            "workingMode",
            "Working Mode",
            "working-mode",
            &["automatic", "manual", "trading"],
        ))
        .with_advertisement(Advertisement::switch("backupMode", "Backup Mode", "backup-mode"))
        .with_advertisement(
            Advertisement::number(
                "maxChargingPower",
                "Max Charging Power",
                "max-charging-power",
                300.0,
                2500.0,
            )
            .with_unit("W"),
        )
        .with_advertisement(
            Advertisement::number(
                "maxDischargePower",
                "Max Discharge Power",
                "max-discharge-power",
                0.0,
                2500.0,
            )
            .with_unit("W"),
        )
        .with_advertisement(Advertisement::button("restart", "Restart"))
        .with_command("working-mode", choice_command(CMD_WORKING_MODE, "md", WORKING_MODES))
        .with_command(
            "max-charging-power",
            number_command(CMD_MAX_CHARGING_POWER, "vv", 300..=2500),
        )
        .with_command(
            "max-discharge-power",
            number_command(CMD_MAX_DISCHARGE_POWER, "vv", 0..=2500),
        )
        .with_command("backup-mode", switch_command(CMD_BACKUP_MODE, "md"))
        .with_command("restart", press_command(CMD_RESTART))
        .with_command("sync-time", sync_time_command(CMD_SYNC_TIME))
}

fn battery_channel() -> ChannelDefinition {
    ChannelDefinition::new("battery", BATTERY_REFRESH)
        .with_marker("b_vol")
        .with_poll_interval(BATTERY_POLL_INTERVAL)
        .with_enabled(|options| options.extra_battery_data)
        .with_field("b_vol", "battery.voltage", FieldTransform::Scaled(0.01))
        .with_field("b_cur", "battery.current", FieldTransform::Scaled(0.01))
        .with_field("b_soc", "battery.soc", FieldTransform::Integer)
        .with_field("b_tmp", "battery.temperature", FieldTransform::Integer)
        .with_field("b_cyc", "battery.cycles", FieldTransform::Integer)
        .with_advertisement(
            Advertisement::sensor("battery.voltage", "Battery Voltage")
                .with_unit("V")
                .with_device_class("voltage")
                .with_state_class("measurement"),
        )
        .with_advertisement(
            Advertisement::sensor("battery.current", "Battery Current")
                .with_unit("A")
                .with_device_class("current")
                .with_state_class("measurement"),
        )
        .with_advertisement(
            Advertisement::sensor("battery.temperature", "Battery Temperature")
                .with_unit("°C")
                .with_device_class("temperature")
                .with_state_class("measurement"),
        )
        .with_advertisement(Advertisement::sensor("battery.cycles", "Battery Cycles"))
}

pub fn hmg_schema() -> BridgeResult<DeviceSchema> {
    DeviceSchema::builder("HMG", "Venus")
        .obfuscated()
        .channel(data_channel())
        .channel(battery_channel())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::Telegram;
    use hmbridge_core::PollOptions;
    use serde_json::json;

    #[test]
    fn test_schema() {
        let schema = hmg_schema().unwrap();
        assert!(schema.obfuscate_current_id);
        let battery = schema.channel("battery").unwrap();
        assert!(!battery.is_enabled(&PollOptions::default()));
        assert!(battery.is_enabled(&PollOptions {
            extra_battery_data: true,
            ..Default::default()
        }));
        assert_eq!(battery.interval(Duration::from_secs(60)), BATTERY_POLL_INTERVAL);
    }

    #[test]
    fn test_battery_telegram_routing() {
        let schema = hmg_schema().unwrap();
        let telegram = Telegram::parse("b_vol=5120,b_cur=-350,b_soc=77");
        let channel = schema.channel_for_telegram(&telegram).unwrap();
        assert_eq!(channel.key, "battery");
        let patch = channel.decode(&telegram);
        assert_eq!(patch["battery"], json!({"voltage": 51.2, "current": -3.5, "soc": 77}));
    }
}
