// grammar.rs — logical vehicle commands <-> canonical "MP-0 C<code>,..." text

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MalformedCommand, RejectedCommand};

// =============================== Wire constants =============================

pub const COMMAND_PREFIX: &str = "MP-0 C";
pub const RESPONSE_PREFIX: &str = "MP-0 c";
pub const KEEPALIVE: &str = "MP-0 A";
pub const KEEPALIVE_REPLY: &str = "MP-0 a";

pub const CHARGE_LIMIT_RANGE: std::ops::RangeInclusive<u8> = 50..=100;
pub const CHARGE_CURRENT_RANGE: std::ops::RangeInclusive<u8> = 0..=100;
pub const HOMELINK_RANGE: std::ops::RangeInclusive<u8> = 1..=3;
pub const FEATURE_RANGE: std::ops::RangeInclusive<u8> = 0..=15;
pub const PARAMETER_RANGE: std::ops::RangeInclusive<u8> = 0..=31;

// =============================== Enums ======================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleFamily {
    #[default]
    Standard,
    Nl,
    Se,
    #[serde(rename = "vwup")]
    VwUp,
    Rz2,
    Sq,
}

impl VehicleFamily {
    pub const ALL: [VehicleFamily; 6] = [
        VehicleFamily::Standard,
        VehicleFamily::Nl,
        VehicleFamily::Se,
        VehicleFamily::VwUp,
        VehicleFamily::Rz2,
        VehicleFamily::Sq,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VehicleFamily::Standard => "standard",
            VehicleFamily::Nl => "nl",
            VehicleFamily::Se => "se",
            VehicleFamily::VwUp => "vwup",
            VehicleFamily::Rz2 => "rz2",
            VehicleFamily::Sq => "sq",
        }
    }
}

impl fmt::Display for VehicleFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        VehicleFamily::ALL
            .into_iter()
            .find(|f| f.as_str() == lower)
            .ok_or_else(|| format!("unknown vehicle family {s:?}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wheel {
    FrontLeft,
    FrontRight,
    RearLeft,
    RearRight,
}

impl Wheel {
    pub const ALL: [Wheel; 4] = [
        Wheel::FrontLeft,
        Wheel::FrontRight,
        Wheel::RearLeft,
        Wheel::RearRight,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Wheel::FrontLeft => "fl",
            Wheel::FrontRight => "fr",
            Wheel::RearLeft => "rl",
            Wheel::RearRight => "rr",
        }
    }
}

impl FromStr for Wheel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Wheel::ALL
            .into_iter()
            .find(|w| w.code() == s)
            .ok_or_else(|| format!("unknown wheel {s:?} (expected fl, fr, rl or rr)"))
    }
}

/// Fieldless discriminant of [`Command`]; the key of the code tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ClimateOn,
    ClimateOff,
    Cooldown,
    ChargeStart,
    ChargeStop,
    SetChargeLimit,
    SetChargeCurrent,
    Lock,
    Unlock,
    ValetOn,
    ValetOff,
    Wake,
    ModuleReset,
    Homelink,
    TpmsReset,
    TpmsMapWheel,
    SendSms,
    SetChargeTimer,
    WakeSubsystem,
    GetFeature,
    SetFeature,
    GetParameter,
    SetParameter,
    Generic,
}

impl CommandKind {
    /// Decode tries kinds in this order; `Generic` must stay last since it accepts any text.
    pub const ALL: [CommandKind; 24] = [
        CommandKind::ClimateOn,
        CommandKind::ClimateOff,
        CommandKind::Cooldown,
        CommandKind::ChargeStart,
        CommandKind::ChargeStop,
        CommandKind::SetChargeLimit,
        CommandKind::SetChargeCurrent,
        CommandKind::Lock,
        CommandKind::Unlock,
        CommandKind::ValetOn,
        CommandKind::ValetOff,
        CommandKind::Wake,
        CommandKind::ModuleReset,
        CommandKind::Homelink,
        CommandKind::TpmsReset,
        CommandKind::TpmsMapWheel,
        CommandKind::SendSms,
        CommandKind::SetChargeTimer,
        CommandKind::WakeSubsystem,
        CommandKind::GetFeature,
        CommandKind::SetFeature,
        CommandKind::GetParameter,
        CommandKind::SetParameter,
        CommandKind::Generic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::ClimateOn => "climate_on",
            CommandKind::ClimateOff => "climate_off",
            CommandKind::Cooldown => "cooldown",
            CommandKind::ChargeStart => "charge_start",
            CommandKind::ChargeStop => "charge_stop",
            CommandKind::SetChargeLimit => "set_charge_limit",
            CommandKind::SetChargeCurrent => "set_charge_current",
            CommandKind::Lock => "lock",
            CommandKind::Unlock => "unlock",
            CommandKind::ValetOn => "valet_on",
            CommandKind::ValetOff => "valet_off",
            CommandKind::Wake => "wake",
            CommandKind::ModuleReset => "module_reset",
            CommandKind::Homelink => "homelink",
            CommandKind::TpmsReset => "tpms_reset",
            CommandKind::TpmsMapWheel => "tpms_map_wheel",
            CommandKind::SendSms => "send_sms",
            CommandKind::SetChargeTimer => "set_charge_timer",
            CommandKind::WakeSubsystem => "wake_subsystem",
            CommandKind::GetFeature => "get_feature",
            CommandKind::SetFeature => "set_feature",
            CommandKind::GetParameter => "get_parameter",
            CommandKind::SetParameter => "set_parameter",
            CommandKind::Generic => "generic",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ================================ Commands ==================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    ClimateOn,
    ClimateOff,
    Cooldown,
    ChargeStart,
    ChargeStop,
    SetChargeLimit { percent: u8 },
    SetChargeCurrent { amps: u8 },
    Lock,
    Unlock,
    ValetOn,
    ValetOff,
    Wake,
    ModuleReset,
    /// HomeLink button, 1-based.
    Homelink { index: u8 },
    TpmsReset,
    TpmsMapWheel { wheel: Wheel, sensor: String },
    SendSms { number: String, body: String },
    /// `None` disables the timer.
    SetChargeTimer { start: Option<NaiveTime> },
    WakeSubsystem { subsystem: u32 },
    GetFeature { index: u8 },
    SetFeature { index: u8, value: String },
    GetParameter { index: u8 },
    SetParameter { index: u8, value: String },
    /// Free-form module command routed through code 7.
    Generic { text: String },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::ClimateOn => CommandKind::ClimateOn,
            Command::ClimateOff => CommandKind::ClimateOff,
            Command::Cooldown => CommandKind::Cooldown,
            Command::ChargeStart => CommandKind::ChargeStart,
            Command::ChargeStop => CommandKind::ChargeStop,
            Command::SetChargeLimit { .. } => CommandKind::SetChargeLimit,
            Command::SetChargeCurrent { .. } => CommandKind::SetChargeCurrent,
            Command::Lock => CommandKind::Lock,
            Command::Unlock => CommandKind::Unlock,
            Command::ValetOn => CommandKind::ValetOn,
            Command::ValetOff => CommandKind::ValetOff,
            Command::Wake => CommandKind::Wake,
            Command::ModuleReset => CommandKind::ModuleReset,
            Command::Homelink { .. } => CommandKind::Homelink,
            Command::TpmsReset => CommandKind::TpmsReset,
            Command::TpmsMapWheel { .. } => CommandKind::TpmsMapWheel,
            Command::SendSms { .. } => CommandKind::SendSms,
            Command::SetChargeTimer { .. } => CommandKind::SetChargeTimer,
            Command::WakeSubsystem { .. } => CommandKind::WakeSubsystem,
            Command::GetFeature { .. } => CommandKind::GetFeature,
            Command::SetFeature { .. } => CommandKind::SetFeature,
            Command::GetParameter { .. } => CommandKind::GetParameter,
            Command::SetParameter { .. } => CommandKind::SetParameter,
            Command::Generic { .. } => CommandKind::Generic,
        }
    }

    /// Validated caller parameters in wire order (fixed table arguments excluded).
    fn params(&self) -> Result<Vec<String>, String> {
        let out = match self {
            Command::ClimateOn
            | Command::ClimateOff
            | Command::Cooldown
            | Command::ChargeStart
            | Command::ChargeStop
            | Command::Lock
            | Command::Unlock
            | Command::ValetOn
            | Command::ValetOff
            | Command::Wake
            | Command::ModuleReset
            | Command::TpmsReset => Vec::new(),

            Command::SetChargeLimit { percent } => {
                in_range("charge limit", *percent, CHARGE_LIMIT_RANGE)?;
                vec![percent.to_string()]
            }
            Command::SetChargeCurrent { amps } => {
                in_range("charge current", *amps, CHARGE_CURRENT_RANGE)?;
                vec![amps.to_string()]
            }
            Command::Homelink { index } => {
                in_range("homelink index", *index, HOMELINK_RANGE)?;
                // buttons are 0-based on the wire
                vec![(index - 1).to_string()]
            }
            Command::TpmsMapWheel { wheel, sensor } => {
                if sensor.is_empty() {
                    return Err("tpms sensor id is empty".into());
                }
                if sensor.contains(|c: char| c.is_whitespace() || c == ',') {
                    return Err(format!("tpms sensor id {sensor:?} contains a separator"));
                }
                vec![format!("tpms map {} {}", wheel.code(), sensor)]
            }
            Command::SendSms { number, body } => {
                if number.is_empty() || number.contains(',') {
                    return Err(format!("sms number {number:?} is empty or contains ','"));
                }
                if body.is_empty() {
                    return Err("sms body is empty".into());
                }
                single_line("sms number", number)?;
                single_line("sms body", body)?;
                vec![number.clone(), body.clone()]
            }
            Command::SetChargeTimer { start: None } => vec!["0".into()],
            Command::SetChargeTimer { start: Some(t) } => {
                if t.second() != 0 || t.nanosecond() != 0 {
                    return Err(format!("charge timer {t} must be on a whole minute"));
                }
                vec!["1".into(), t.hour().to_string(), t.minute().to_string()]
            }
            Command::WakeSubsystem { subsystem } => vec![subsystem.to_string()],
            Command::GetFeature { index } => {
                in_range("feature index", *index, FEATURE_RANGE)?;
                vec![index.to_string()]
            }
            Command::SetFeature { index, value } => {
                in_range("feature index", *index, FEATURE_RANGE)?;
                if value.contains(',') {
                    return Err(format!("feature value {value:?} contains ','"));
                }
                single_line("feature value", value)?;
                vec![index.to_string(), value.clone()]
            }
            Command::GetParameter { index } => {
                in_range("parameter index", *index, PARAMETER_RANGE)?;
                vec![index.to_string()]
            }
            Command::SetParameter { index, value } => {
                in_range("parameter index", *index, PARAMETER_RANGE)?;
                single_line("parameter value", value)?;
                vec![index.to_string(), value.clone()]
            }
            Command::Generic { text } => {
                if text.is_empty() {
                    return Err("generic command text is empty".into());
                }
                single_line("generic command", text)?;
                vec![text.clone()]
            }
        };
        Ok(out)
    }
}

fn in_range(what: &str, v: u8, range: std::ops::RangeInclusive<u8>) -> Result<(), String> {
    if range.contains(&v) {
        Ok(())
    } else {
        Err(format!(
            "{what} {v} outside {}..={}",
            range.start(),
            range.end()
        ))
    }
}

fn single_line(what: &str, v: &str) -> Result<(), String> {
    if v.contains(['\r', '\n']) {
        Err(format!("{what} contains a line break"))
    } else {
        Ok(())
    }
}

// =========================== Code tables ====================================

/// Numeric code plus any arguments the protocol fixes for the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub code: u16,
    pub fixed: &'static [&'static str],
}

#[derive(Debug, Clone, Copy)]
enum Override {
    Remap(Route),
    Unsupported(&'static str),
}

const fn route(code: u16, fixed: &'static [&'static str]) -> Route {
    Route { code, fixed }
}

const DEFAULT_ROUTES: [(CommandKind, Route); 24] = [
    (CommandKind::ClimateOn, route(26, &["1"])),
    (CommandKind::ClimateOff, route(26, &["0"])),
    (CommandKind::Cooldown, route(25, &[])),
    (CommandKind::ChargeStart, route(11, &[])),
    (CommandKind::ChargeStop, route(12, &[])),
    (CommandKind::SetChargeLimit, route(16, &[])),
    (CommandKind::SetChargeCurrent, route(15, &[])),
    (CommandKind::Lock, route(20, &[])),
    (CommandKind::Unlock, route(22, &[])),
    (CommandKind::ValetOn, route(21, &[])),
    (CommandKind::ValetOff, route(23, &[])),
    (CommandKind::Wake, route(18, &[])),
    (CommandKind::ModuleReset, route(5, &[])),
    (CommandKind::Homelink, route(24, &[])),
    (CommandKind::TpmsReset, route(7, &["tpms map reset"])),
    (CommandKind::TpmsMapWheel, route(7, &[])),
    (CommandKind::SendSms, route(40, &[])),
    (CommandKind::SetChargeTimer, route(17, &[])),
    (CommandKind::WakeSubsystem, route(19, &[])),
    (CommandKind::GetFeature, route(1, &[])),
    (CommandKind::SetFeature, route(2, &[])),
    (CommandKind::GetParameter, route(3, &[])),
    (CommandKind::SetParameter, route(4, &[])),
    (CommandKind::Generic, route(7, &[])),
];

/// Adding a vehicle family is a data change here, nowhere else.
const FAMILY_OVERRIDES: [(CommandKind, VehicleFamily, Override); 3] = [
    // SQ drives climate through the 24 timer slot (0 = 5 minutes)
    (
        CommandKind::ClimateOn,
        VehicleFamily::Sq,
        Override::Remap(route(24, &["0"])),
    ),
    (
        CommandKind::ClimateOff,
        VehicleFamily::Sq,
        Override::Remap(route(7, &["climate off"])),
    ),
    (
        CommandKind::Homelink,
        VehicleFamily::Sq,
        Override::Unsupported("code 24 is the climate timer on this family"),
    ),
];

/// Resolve the wire route of `kind` for `family`.
pub fn route_for(kind: CommandKind, family: VehicleFamily) -> Result<Route, RejectedCommand> {
    let overridden = FAMILY_OVERRIDES
        .iter()
        .find(|(k, f, _)| *k == kind && *f == family)
        .map(|(_, _, o)| *o);

    match overridden {
        Some(Override::Remap(r)) => Ok(r),
        Some(Override::Unsupported(why)) => Err(RejectedCommand::new(
            kind,
            format!("not supported on {family}: {why}"),
        )),
        None => DEFAULT_ROUTES
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, r)| *r)
            .ok_or_else(|| RejectedCommand::new(kind, "no code assigned")),
    }
}

// ========================== Encode / decode =================================

/// Grammar output: the numeric code (for logs) and the full canonical text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalCommand {
    pub kind: CommandKind,
    pub code: u16,
    pub text: String,
}

impl fmt::Display for CanonicalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

pub fn encode(command: &Command, family: VehicleFamily) -> Result<CanonicalCommand, RejectedCommand> {
    let kind = command.kind();
    let params = command
        .params()
        .map_err(|reason| RejectedCommand::new(kind, reason))?;
    let route = route_for(kind, family)?;

    let mut text = format!("{COMMAND_PREFIX}{}", route.code);
    let args = route.fixed.iter().map(|s| s.to_string()).chain(params);
    for arg in args {
        text.push(',');
        text.push_str(&arg);
    }

    // free-form text must not alias a structured command's canonical form
    if kind == CommandKind::Generic {
        match decode(&text, family) {
            Ok(back) if back == *command => {}
            Ok(back) => {
                return Err(RejectedCommand::new(
                    kind,
                    format!("text is reserved for {}; use that command", back.kind()),
                ));
            }
            Err(e) => return Err(RejectedCommand::new(kind, e.reason)),
        }
    }

    Ok(CanonicalCommand {
        kind,
        code: route.code,
        text,
    })
}

pub fn decode(input: &str, family: VehicleFamily) -> Result<Command, MalformedCommand> {
    let body = input
        .strip_prefix(COMMAND_PREFIX)
        .ok_or_else(|| MalformedCommand::new(input, "missing command prefix"))?;
    let (code_str, rest) = match body.split_once(',') {
        Some((c, r)) => (c, Some(r)),
        None => (body, None),
    };
    let code = parse_num::<u16>(code_str)
        .ok_or_else(|| MalformedCommand::new(input, "command code is not a number"))?;

    let mut out_of_range = false;
    for kind in CommandKind::ALL {
        let Ok(route) = route_for(kind, family) else {
            continue;
        };
        if route.code != code {
            continue;
        }
        let Some(args) = strip_fixed(rest, route.fixed) else {
            continue;
        };
        if let Some(cmd) = parse_params(kind, args) {
            // ranges are enforced on the way in as well as out; a later
            // kind sharing the code (free-form text) may still claim it
            if cmd.params().is_ok() {
                return Ok(cmd);
            }
            out_of_range = true;
        }
    }
    if out_of_range {
        return Err(MalformedCommand::new(input, "parameter out of range"));
    }
    Err(MalformedCommand::new(input, "no command matches code and parameters"))
}

fn strip_fixed<'a>(rest: Option<&'a str>, fixed: &[&str]) -> Option<Option<&'a str>> {
    let mut rest = rest;
    for want in fixed {
        let r = rest?;
        rest = match r.split_once(',') {
            Some((head, tail)) if head == *want => Some(tail),
            None if r == *want => None,
            _ => return None,
        };
    }
    Some(rest)
}

/// Strict decimal: no sign, no leading zeros, so decode stays the inverse of encode.
fn parse_num<T: FromStr>(s: &str) -> Option<T> {
    let canonical = !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit())
        && (s == "0" || !s.starts_with('0'));
    if canonical { s.parse().ok() } else { None }
}

fn parse_params(kind: CommandKind, args: Option<&str>) -> Option<Command> {
    let cmd = match kind {
        CommandKind::ClimateOn => no_args(args, Command::ClimateOn)?,
        CommandKind::ClimateOff => no_args(args, Command::ClimateOff)?,
        CommandKind::Cooldown => no_args(args, Command::Cooldown)?,
        CommandKind::ChargeStart => no_args(args, Command::ChargeStart)?,
        CommandKind::ChargeStop => no_args(args, Command::ChargeStop)?,
        CommandKind::Lock => no_args(args, Command::Lock)?,
        CommandKind::Unlock => no_args(args, Command::Unlock)?,
        CommandKind::ValetOn => no_args(args, Command::ValetOn)?,
        CommandKind::ValetOff => no_args(args, Command::ValetOff)?,
        CommandKind::Wake => no_args(args, Command::Wake)?,
        CommandKind::ModuleReset => no_args(args, Command::ModuleReset)?,
        CommandKind::TpmsReset => no_args(args, Command::TpmsReset)?,

        CommandKind::SetChargeLimit => Command::SetChargeLimit {
            percent: parse_num(args?)?,
        },
        CommandKind::SetChargeCurrent => Command::SetChargeCurrent {
            amps: parse_num(args?)?,
        },
        CommandKind::Homelink => {
            let button: u8 = parse_num(args?)?;
            Command::Homelink {
                index: button.checked_add(1)?,
            }
        }
        CommandKind::TpmsMapWheel => {
            let spec = args?.strip_prefix("tpms map ")?;
            let (wheel, sensor) = spec.split_once(' ')?;
            Command::TpmsMapWheel {
                wheel: wheel.parse().ok()?,
                sensor: sensor.to_string(),
            }
        }
        CommandKind::SendSms => {
            let (number, body) = args?.split_once(',')?;
            Command::SendSms {
                number: number.to_string(),
                body: body.to_string(),
            }
        }
        CommandKind::SetChargeTimer => match args? {
            "0" => Command::SetChargeTimer { start: None },
            other => {
                let mut parts = other.split(',');
                if parts.next()? != "1" {
                    return None;
                }
                let hour = parse_num(parts.next()?)?;
                let minute = parse_num(parts.next()?)?;
                if parts.next().is_some() {
                    return None;
                }
                Command::SetChargeTimer {
                    start: Some(NaiveTime::from_hms_opt(hour, minute, 0)?),
                }
            }
        },
        CommandKind::WakeSubsystem => Command::WakeSubsystem {
            subsystem: parse_num(args?)?,
        },
        CommandKind::GetFeature => Command::GetFeature {
            index: parse_num(args?)?,
        },
        CommandKind::SetFeature => {
            let (index, value) = args?.split_once(',')?;
            Command::SetFeature {
                index: parse_num(index)?,
                value: value.to_string(),
            }
        }
        CommandKind::GetParameter => Command::GetParameter {
            index: parse_num(args?)?,
        },
        CommandKind::SetParameter => {
            let (index, value) = args?.split_once(',')?;
            Command::SetParameter {
                index: parse_num(index)?,
                value: value.to_string(),
            }
        }
        CommandKind::Generic => Command::Generic {
            text: args?.to_string(),
        },
    };
    Some(cmd)
}

fn no_args(args: Option<&str>, cmd: Command) -> Option<Command> {
    args.is_none().then_some(cmd)
}

// =============================== Responses ==================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    Failed,
    Unsupported,
    Unimplemented,
    Other(i32),
}

impl ResultCode {
    pub fn from_wire(n: i32) -> Self {
        match n {
            0 => ResultCode::Ok,
            1 => ResultCode::Failed,
            2 => ResultCode::Unsupported,
            3 => ResultCode::Unimplemented,
            other => ResultCode::Other(other),
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::Failed => 1,
            ResultCode::Unsupported => 2,
            ResultCode::Unimplemented => 3,
            ResultCode::Other(n) => n,
        }
    }
}

/// Vehicle reply to a command: `MP-0 c<code>,<result>[,<message>]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub code: u16,
    pub result: ResultCode,
    pub message: String,
}

impl CommandResponse {
    pub fn is_success(&self) -> bool {
        self.result == ResultCode::Ok
    }

    pub fn parse(input: &str) -> Result<Self, MalformedCommand> {
        let body = input
            .strip_prefix(RESPONSE_PREFIX)
            .ok_or_else(|| MalformedCommand::new(input, "missing response prefix"))?;
        let mut parts = body.splitn(3, ',');
        let code = parts
            .next()
            .and_then(parse_num::<u16>)
            .ok_or_else(|| MalformedCommand::new(input, "response code is not a number"))?;
        let result = parts
            .next()
            .and_then(|r| r.parse::<i32>().ok())
            .map(ResultCode::from_wire)
            .ok_or_else(|| MalformedCommand::new(input, "missing result code"))?;
        Ok(Self {
            code,
            result,
            message: parts.next().unwrap_or_default().to_string(),
        })
    }

    pub fn to_wire(&self) -> String {
        let mut s = format!("{RESPONSE_PREFIX}{},{}", self.code, self.result.to_wire());
        if !self.message.is_empty() {
            s.push(',');
            s.push_str(&self.message);
        }
        s
    }
}

// ================================ Tests =====================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn text(cmd: &Command, family: VehicleFamily) -> String {
        encode(cmd, family).expect("encode").text
    }

    #[test]
    fn climate_uses_family_override() {
        assert_eq!(text(&Command::ClimateOn, VehicleFamily::Standard), "MP-0 C26,1");
        assert_eq!(text(&Command::ClimateOff, VehicleFamily::Standard), "MP-0 C26,0");
        assert_eq!(text(&Command::ClimateOn, VehicleFamily::Sq), "MP-0 C24,0");
        assert_eq!(text(&Command::ClimateOff, VehicleFamily::Sq), "MP-0 C7,climate off");
        // families without overrides fall through to the defaults
        assert_eq!(text(&Command::ClimateOn, VehicleFamily::VwUp), "MP-0 C26,1");
    }

    #[test]
    fn documented_codes() {
        let f = VehicleFamily::Standard;
        assert_eq!(text(&Command::Cooldown, f), "MP-0 C25");
        assert_eq!(text(&Command::ChargeStart, f), "MP-0 C11");
        assert_eq!(text(&Command::ChargeStop, f), "MP-0 C12");
        assert_eq!(text(&Command::SetChargeLimit { percent: 80 }, f), "MP-0 C16,80");
        assert_eq!(text(&Command::SetChargeCurrent { amps: 16 }, f), "MP-0 C15,16");
        assert_eq!(text(&Command::Lock, f), "MP-0 C20");
        assert_eq!(text(&Command::Unlock, f), "MP-0 C22");
        assert_eq!(text(&Command::Wake, f), "MP-0 C18");
        assert_eq!(text(&Command::ModuleReset, f), "MP-0 C5");
        assert_eq!(text(&Command::Homelink { index: 1 }, f), "MP-0 C24,0");
        assert_eq!(text(&Command::Homelink { index: 3 }, f), "MP-0 C24,2");
        assert_eq!(text(&Command::TpmsReset, f), "MP-0 C7,tpms map reset");
        assert_eq!(
            text(
                &Command::TpmsMapWheel {
                    wheel: Wheel::RearLeft,
                    sensor: "0A1B2C".into()
                },
                f
            ),
            "MP-0 C7,tpms map rl 0A1B2C"
        );
        assert_eq!(
            text(
                &Command::SendSms {
                    number: "+3161234".into(),
                    body: "hi, there".into()
                },
                f
            ),
            "MP-0 C40,+3161234,hi, there"
        );
        assert_eq!(
            text(
                &Command::SetChargeTimer {
                    start: NaiveTime::from_hms_opt(23, 5, 0)
                },
                f
            ),
            "MP-0 C17,1,23,5"
        );
        assert_eq!(text(&Command::SetChargeTimer { start: None }, f), "MP-0 C17,0");
        assert_eq!(text(&Command::WakeSubsystem { subsystem: 2 }, f), "MP-0 C19,2");
        assert_eq!(text(&Command::GetFeature { index: 8 }, f), "MP-0 C1,8");
        assert_eq!(
            text(&Command::SetFeature { index: 8, value: "60".into() }, f),
            "MP-0 C2,8,60"
        );
        assert_eq!(text(&Command::GetParameter { index: 31 }, f), "MP-0 C3,31");
        assert_eq!(
            text(&Command::SetParameter { index: 0, value: "a,b".into() }, f),
            "MP-0 C4,0,a,b"
        );
    }

    #[test]
    fn charge_limit_below_minimum_is_rejected() {
        let err = encode(&Command::SetChargeLimit { percent: 45 }, VehicleFamily::Standard)
            .unwrap_err();
        assert_eq!(err.kind, CommandKind::SetChargeLimit);
        assert!(err.reason.contains("45"), "{}", err.reason);
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let f = VehicleFamily::Standard;
        assert!(encode(&Command::SetChargeLimit { percent: 101 }, f).is_err());
        assert!(encode(&Command::GetFeature { index: 16 }, f).is_err());
        assert!(encode(&Command::GetParameter { index: 32 }, f).is_err());
        assert!(encode(&Command::Homelink { index: 0 }, f).is_err());
        assert!(encode(&Command::Homelink { index: 4 }, f).is_err());
        assert!(encode(&Command::SetChargeCurrent { amps: 101 }, f).is_err());
    }

    #[test]
    fn text_parameters_are_validated() {
        let f = VehicleFamily::Standard;
        let sms = |number: &str, body: &str| Command::SendSms {
            number: number.into(),
            body: body.into(),
        };
        assert!(encode(&sms("", "x"), f).is_err());
        assert!(encode(&sms("1,2", "x"), f).is_err());
        assert!(encode(&sms("123", "line\nbreak"), f).is_err());
        assert!(encode(&sms("123", ""), f).is_err());
        let map = |sensor: &str| Command::TpmsMapWheel {
            wheel: Wheel::FrontLeft,
            sensor: sensor.into(),
        };
        assert!(encode(&map("ab cd"), f).is_err());
        assert!(encode(&map(""), f).is_err());
        assert!(encode(&Command::SetFeature { index: 1, value: "a,b".into() }, f).is_err());
        let timer = Command::SetChargeTimer {
            start: NaiveTime::from_hms_opt(1, 2, 3),
        };
        assert!(encode(&timer, f).is_err());
    }

    #[test]
    fn homelink_is_unsupported_on_sq() {
        let err = encode(&Command::Homelink { index: 1 }, VehicleFamily::Sq).unwrap_err();
        assert_eq!(err.kind, CommandKind::Homelink);
    }

    #[test]
    fn generic_cannot_alias_structured_commands() {
        let reserved = Command::Generic {
            text: "tpms map reset".into(),
        };
        assert!(encode(&reserved, VehicleFamily::Standard).is_err());

        let sq_reserved = Command::Generic {
            text: "climate off".into(),
        };
        assert!(encode(&sq_reserved, VehicleFamily::Sq).is_err());
        // only SQ routes climate off through code 7
        assert_eq!(
            text(&sq_reserved, VehicleFamily::Standard),
            "MP-0 C7,climate off"
        );
    }

    #[test]
    fn generic_text_near_a_structured_form_still_encodes() {
        // parses as a wheel mapping but the sensor id is invalid, so it is no alias
        let near = Command::Generic {
            text: "tpms map fl a b".into(),
        };
        assert_eq!(text(&near, VehicleFamily::Standard), "MP-0 C7,tpms map fl a b");
        assert_eq!(decode("MP-0 C7,tpms map fl a b", VehicleFamily::Standard), Ok(near));

        let err = decode("MP-0 C16,45", VehicleFamily::Standard).unwrap_err();
        assert_eq!(err.reason, "parameter out of range");
    }

    #[test]
    fn decode_rejects_garbage() {
        let f = VehicleFamily::Standard;
        assert!(decode("C26,1", f).is_err());
        assert!(decode("MP-0 Cxx", f).is_err());
        assert!(decode("MP-0 C99", f).is_err());
        assert!(decode("MP-0 C16,45", f).is_err());
        assert!(decode("MP-0 C16,080", f).is_err());
        assert!(decode("MP-0 C25,1", f).is_err());
        assert!(decode("MP-0 C17,1,25,0", f).is_err());
        // SQ has no route to code 26
        assert!(decode("MP-0 C26,1", VehicleFamily::Sq).is_err());
    }

    #[test]
    fn response_parsing() {
        let ok = CommandResponse::parse("MP-0 c26,0").unwrap();
        assert_eq!(ok.code, 26);
        assert!(ok.is_success());
        assert!(ok.message.is_empty());

        let failed = CommandResponse::parse("MP-0 c20,1,wrong pin, try again").unwrap();
        assert_eq!(failed.result, ResultCode::Failed);
        assert_eq!(failed.message, "wrong pin, try again");
        assert_eq!(failed.to_wire(), "MP-0 c20,1,wrong pin, try again");

        assert_eq!(
            CommandResponse::parse("MP-0 c5,9").unwrap().result,
            ResultCode::Other(9)
        );
        assert!(CommandResponse::parse("MP-0 c26").is_err());
        assert!(CommandResponse::parse("MP-0 C26,0").is_err());
    }

    #[test]
    fn family_from_str() {
        assert_eq!("SQ".parse::<VehicleFamily>().unwrap(), VehicleFamily::Sq);
        assert_eq!("vwup".parse::<VehicleFamily>().unwrap(), VehicleFamily::VwUp);
        assert!("tesla".parse::<VehicleFamily>().is_err());
    }

    fn arb_command() -> impl Strategy<Value = Command> {
        let wheel = prop::sample::select(Wheel::ALL.to_vec());
        prop_oneof![
            Just(Command::ClimateOn),
            Just(Command::ClimateOff),
            Just(Command::Cooldown),
            Just(Command::ChargeStart),
            Just(Command::ChargeStop),
            CHARGE_LIMIT_RANGE.prop_map(|percent| Command::SetChargeLimit { percent }),
            CHARGE_CURRENT_RANGE.prop_map(|amps| Command::SetChargeCurrent { amps }),
            Just(Command::Lock),
            Just(Command::Unlock),
            Just(Command::ValetOn),
            Just(Command::ValetOff),
            Just(Command::Wake),
            Just(Command::ModuleReset),
            HOMELINK_RANGE.prop_map(|index| Command::Homelink { index }),
            Just(Command::TpmsReset),
            (wheel, "[0-9A-F]{6,8}")
                .prop_map(|(wheel, sensor)| Command::TpmsMapWheel { wheel, sensor }),
            ("\\+?[0-9]{3,15}", "[ -~]{1,40}")
                .prop_map(|(number, body)| Command::SendSms { number, body }),
            proptest::option::of((0u32..24, 0u32..60)).prop_map(|hm| Command::SetChargeTimer {
                start: hm.and_then(|(h, m)| NaiveTime::from_hms_opt(h, m, 0)),
            }),
            any::<u32>().prop_map(|subsystem| Command::WakeSubsystem { subsystem }),
            FEATURE_RANGE.prop_map(|index| Command::GetFeature { index }),
            (FEATURE_RANGE, "[A-Za-z0-9 ]{0,12}")
                .prop_map(|(index, value)| Command::SetFeature { index, value }),
            PARAMETER_RANGE.prop_map(|index| Command::GetParameter { index }),
            (PARAMETER_RANGE, "[ -~]{0,20}")
                .prop_map(|(index, value)| Command::SetParameter { index, value }),
            "[a-z][ -~]{0,30}".prop_map(|text| Command::Generic { text }),
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            cmd in arb_command(),
            family in prop::sample::select(VehicleFamily::ALL.to_vec()),
        ) {
            match encode(&cmd, family) {
                Ok(canonical) => {
                    prop_assert_eq!(canonical.kind, cmd.kind());
                    prop_assert_eq!(decode(&canonical.text, family), Ok(cmd));
                }
                Err(rejected) => {
                    // the only producible rejections in this domain
                    let expected = matches!(
                        (&cmd, family),
                        (Command::Homelink { .. }, VehicleFamily::Sq) | (Command::Generic { .. }, _)
                    );
                    prop_assert!(expected, "unexpected rejection: {}", rejected);
                }
            }
        }

        #[test]
        fn out_of_range_charge_limit_never_encodes(percent in prop_oneof![0u8..50, 101u8..=255]) {
            let encoded = encode(&Command::SetChargeLimit { percent }, VehicleFamily::Standard);
            prop_assert!(encoded.is_err(), "{}% encoded as {:?}", percent, encoded);
        }
    }
}
