//! Payload validation and command encoding helpers shared by the device
//! families.
//!
//! Every parser returns `BridgeError::Validation` on rejection so a handler
//! can bail out with `?` before it publishes or patches anything.

use serde::Deserialize;
use std::ops::RangeInclusive;

use hmbridge_core::{BridgeError, BridgeResult};

use crate::dispatcher::CommandContext;
use crate::telegram::Telegram;

pub const TRUE_LITERALS: &[&str] = &["true", "1", "ON", "on"];
pub const FALSE_LITERALS: &[&str] = &["false", "0", "OFF", "off"];
pub const PRESS_LITERALS: &[&str] = &["PRESS", "press", "true", "1", "ON"];

/// Parse a boolean payload.
pub fn parse_bool(payload: &str) -> BridgeResult<bool> {
    let payload = payload.trim();
    if TRUE_LITERALS.contains(&payload) {
        Ok(true)
    } else if FALSE_LITERALS.contains(&payload) {
        Ok(false)
    } else {
        Err(BridgeError::validation(format!(
            "Expected a boolean, got '{}'",
            payload
        )))
    }
}

/// Accept a button press.
pub fn parse_press(payload: &str) -> BridgeResult<()> {
    if PRESS_LITERALS.contains(&payload.trim()) {
        Ok(())
    } else {
        Err(BridgeError::validation(format!(
            "Expected a press payload, got '{}'",
            payload
        )))
    }
}

/// Parse an integer within an inclusive range.
pub fn parse_in_range(payload: &str, range: RangeInclusive<i64>) -> BridgeResult<i64> {
    let value = payload
        .trim()
        .parse::<i64>()
        .map_err(|_| BridgeError::validation(format!("Expected an integer, got '{}'", payload)))?;
    if !range.contains(&value) {
        return Err(BridgeError::validation(format!(
            "Value {} out of range [{}, {}]",
            value,
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

/// Map a human-readable name to its protocol code.
pub fn parse_choice<T: Copy>(payload: &str, choices: &[(&str, T)]) -> BridgeResult<T> {
    let payload = payload.trim();
    choices
        .iter()
        .find(|(name, _)| *name == payload)
        .map(|(_, code)| *code)
        .ok_or_else(|| {
            let names: Vec<&str> = choices.iter().map(|(name, _)| *name).collect();
            BridgeError::validation(format!(
                "Expected one of [{}], got '{}'",
                names.join(", "),
                payload
            ))
        })
}

/// Normalize `H:M` to `HH:MM`.
pub fn normalize_time(raw: &str) -> Option<String> {
    let (hours, minutes) = raw.trim().split_once(':')?;
    let hours: u8 = hours.parse().ok()?;
    let minutes: u8 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(format!("{:02}:{:02}", hours, minutes))
}

/// Parse an `HH:MM` payload.
pub fn parse_time(payload: &str) -> BridgeResult<String> {
    normalize_time(payload)
        .ok_or_else(|| BridgeError::validation(format!("Expected HH:MM, got '{}'", payload)))
}

/// Time synchronisation payload: `{"wy":480,"yy":124,"mm":6,"rr":1,"hh":8,"mn":30,"ss":0}`.
///
/// `wy` is the UTC offset in minutes, `yy` the year minus 1900.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeSync {
    pub wy: i32,
    pub yy: u32,
    pub mm: u32,
    pub rr: u32,
    pub hh: u32,
    pub mn: u32,
    pub ss: u32,
}

impl TimeSync {
    pub fn parse(payload: &str) -> BridgeResult<Self> {
        let sync: TimeSync = serde_json::from_str(payload.trim())
            .map_err(|e| BridgeError::validation(format!("Invalid time sync payload: {}", e)))?;
        let valid = (-720..=840).contains(&sync.wy)
            && (100..=199).contains(&sync.yy)
            && (1..=12).contains(&sync.mm)
            && (1..=31).contains(&sync.rr)
            && sync.hh <= 23
            && sync.mn <= 59
            && sync.ss <= 59;
        if !valid {
            return Err(BridgeError::validation(format!(
                "Time sync values out of range: {}",
                payload
            )));
        }
        Ok(sync)
    }

    /// Encode in the firmware's key order.
    pub fn to_telegram(&self, code: u32) -> Telegram {
        Telegram::command(code)
            .with("wy", self.wy)
            .with("yy", self.yy)
            .with("mm", self.mm)
            .with("rr", self.rr)
            .with("hh", self.hh)
            .with("mn", self.mn)
            .with("ss", self.ss)
    }
}

// Handler constructors. Each returns a closure suitable for
// `ChannelDefinition::with_command`.

/// `cd=<code>` on press.
pub fn press_command(
    code: u32,
) -> impl Fn(&mut CommandContext<'_>) -> BridgeResult<()> + Send + Sync + 'static {
    move |ctx| {
        parse_press(ctx.payload())?;
        ctx.publish(Telegram::command(code));
        Ok(())
    }
}

/// `cd=<code>,<key>=<n>` for an integer in `range`.
pub fn number_command(
    code: u32,
    key: &'static str,
    range: RangeInclusive<i64>,
) -> impl Fn(&mut CommandContext<'_>) -> BridgeResult<()> + Send + Sync + 'static {
    move |ctx| {
        let value = parse_in_range(ctx.payload(), range.clone())?;
        ctx.publish(Telegram::command(code).with(key, value));
        Ok(())
    }
}

/// `cd=<code>,<key>=<code>` for a named choice.
pub fn choice_command(
    code: u32,
    key: &'static str,
    choices: &'static [(&'static str, u32)],
) -> impl Fn(&mut CommandContext<'_>) -> BridgeResult<()> + Send + Sync + 'static {
    move |ctx| {
        let value = parse_choice(ctx.payload(), choices)?;
        ctx.publish(Telegram::command(code).with(key, value));
        Ok(())
    }
}

/// `cd=<code>,<key>=1|0` for a boolean.
pub fn switch_command(
    code: u32,
    key: &'static str,
) -> impl Fn(&mut CommandContext<'_>) -> BridgeResult<()> + Send + Sync + 'static {
    move |ctx| {
        let enabled = parse_bool(ctx.payload())?;
        ctx.publish(Telegram::command(code).with(key, u8::from(enabled)));
        Ok(())
    }
}

/// Time synchronisation from a compact JSON payload.
pub fn sync_time_command(
    code: u32,
) -> impl Fn(&mut CommandContext<'_>) -> BridgeResult<()> + Send + Sync + 'static {
    move |ctx| {
        let sync = TimeSync::parse(ctx.payload())?;
        ctx.publish(sync.to_telegram(code));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_literals() {
        assert!(parse_bool("true").unwrap());
        assert!(parse_bool("ON").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("yes").is_err());
        assert!(parse_bool("TRUE").is_err());
    }

    #[test]
    fn test_parse_in_range_is_inclusive() {
        assert_eq!(parse_in_range("0", 0..=100).unwrap(), 0);
        assert_eq!(parse_in_range("100", 0..=100).unwrap(), 100);
        assert!(parse_in_range("101", 0..=100).is_err());
        assert!(parse_in_range("-1", 0..=100).is_err());
        assert!(parse_in_range("50.5", 0..=100).is_err());
    }

    #[test]
    fn test_parse_choice() {
        let choices = [("automatic", 0u32), ("manual", 1)];
        assert_eq!(parse_choice("manual", &choices).unwrap(), 1);
        let err = parse_choice("turbo", &choices).unwrap_err();
        assert!(err.to_string().contains("automatic, manual"));
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("7:05").unwrap(), "07:05");
        assert_eq!(parse_time("23:59").unwrap(), "23:59");
        assert!(parse_time("24:00").is_err());
        assert!(parse_time("0700").is_err());
    }

    #[test]
    fn test_time_sync_encoding() {
        let sync = TimeSync::parse(r#"{"wy":480,"yy":124,"mm":6,"rr":1,"hh":8,"mn":30,"ss":5}"#)
            .unwrap();
        assert_eq!(
            sync.to_telegram(8).to_string(),
            "cd=8,wy=480,yy=124,mm=6,rr=1,hh=8,mn=30,ss=5"
        );
        assert!(TimeSync::parse(r#"{"wy":480,"yy":124,"mm":13,"rr":1,"hh":8,"mn":30,"ss":5}"#).is_err());
        assert!(TimeSync::parse(r#"{"wy":480}"#).is_err());
        assert!(TimeSync::parse("now").is_err());
    }
}
