// config.rs — command line over optional TOML file and OVMS_* environment
//
// Precedence: flags, then file / environment, then built-in defaults.
use anyhow::{Context, Result};
use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use vehicle_protocol::{Command, VehicleFamily, Wheel, DEFAULT_RELAY_PORT};

use crate::logging::journal::Journal;
use crate::transport::{
    TransportConfig, DEFAULT_AUTH_FAILURE_LIMIT, DEFAULT_COMMAND_TIMEOUT, DEFAULT_KEEPALIVE,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub relay_addr: String,
    pub family: VehicleFamily,
    pub secret_hex: String,
    pub nonce_hex: String,
    pub command_timeout: Duration,
    pub keepalive: Option<Duration>,
    pub auth_failure_limit: u32,
    pub log_dir: Option<PathBuf>,
    pub journal: Option<PathBuf>,
    pub json: bool,
    pub command: Command,
}

impl Config {
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            family: self.family,
            command_timeout: self.command_timeout,
            keepalive: self.keepalive,
            auth_failure_limit: self.auth_failure_limit,
            journal: self.journal.as_ref().map(Journal::new),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "ovms-command", version, about = "Send one command to a vehicle through an OVMS v2 relay")]
pub struct Cli {
    /// TOML file with any of the long option names as keys
    #[arg(long)]                pub config: Option<PathBuf>,
    #[arg(long)]                pub host: Option<String>,
    #[arg(long)]                pub port: Option<u16>,
    /// standard, nl, se, vwup, rz2 or sq
    #[arg(long)]                pub family: Option<String>,
    #[arg(long)]                pub secret_hex: Option<String>,
    #[arg(long)]                pub nonce_hex: Option<String>,
    #[arg(long)]                pub timeout_secs: Option<u64>,
    /// 0 disables the keepalive ping
    #[arg(long)]                pub keepalive_secs: Option<u64>,
    #[arg(long)]                pub auth_failure_limit: Option<u32>,
    #[arg(long)]                pub log_dir: Option<PathBuf>,
    #[arg(long)]                pub journal: Option<PathBuf>,
    /// print the completion as JSON
    #[arg(long, default_value_t = false)] pub json: bool,
    #[command(subcommand)]
    pub command: CommandArg,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CommandArg {
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
    Homelink { index: u8 },
    TpmsReset,
    TpmsMapWheel { wheel: Wheel, sensor: String },
    SendSms { number: String, body: String },
    /// HH:MM start time; omit to disable the timer
    SetChargeTimer {
        #[arg(value_parser = parse_hhmm)]
        start: Option<NaiveTime>,
    },
    WakeSubsystem { subsystem: u32 },
    GetFeature { index: u8 },
    SetFeature { index: u8, value: String },
    GetParameter { index: u8 },
    SetParameter { index: u8, value: String },
    /// free-form module command, sent as code 7
    Generic { text: String },
}

fn parse_hhmm(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| format!("{s:?} is not HH:MM: {e}"))
}

impl From<CommandArg> for Command {
    fn from(arg: CommandArg) -> Self {
        match arg {
            CommandArg::ClimateOn => Command::ClimateOn,
            CommandArg::ClimateOff => Command::ClimateOff,
            CommandArg::Cooldown => Command::Cooldown,
            CommandArg::ChargeStart => Command::ChargeStart,
            CommandArg::ChargeStop => Command::ChargeStop,
            CommandArg::SetChargeLimit { percent } => Command::SetChargeLimit { percent },
            CommandArg::SetChargeCurrent { amps } => Command::SetChargeCurrent { amps },
            CommandArg::Lock => Command::Lock,
            CommandArg::Unlock => Command::Unlock,
            CommandArg::ValetOn => Command::ValetOn,
            CommandArg::ValetOff => Command::ValetOff,
            CommandArg::Wake => Command::Wake,
            CommandArg::ModuleReset => Command::ModuleReset,
            CommandArg::Homelink { index } => Command::Homelink { index },
            CommandArg::TpmsReset => Command::TpmsReset,
            CommandArg::TpmsMapWheel { wheel, sensor } => Command::TpmsMapWheel { wheel, sensor },
            CommandArg::SendSms { number, body } => Command::SendSms { number, body },
            CommandArg::SetChargeTimer { start } => Command::SetChargeTimer { start },
            CommandArg::WakeSubsystem { subsystem } => Command::WakeSubsystem { subsystem },
            CommandArg::GetFeature { index } => Command::GetFeature { index },
            CommandArg::SetFeature { index, value } => Command::SetFeature { index, value },
            CommandArg::GetParameter { index } => Command::GetParameter { index },
            CommandArg::SetParameter { index, value } => Command::SetParameter { index, value },
            CommandArg::Generic { text } => Command::Generic { text },
        }
    }
}

/// Everything the file / environment layer may supply.
#[derive(Debug, Deserialize)]
struct Settings {
    host: String,
    port: u16,
    family: String,
    secret_hex: Option<String>,
    nonce_hex: Option<String>,
    timeout_secs: u64,
    keepalive_secs: u64,
    auth_failure_limit: u32,
    log_dir: Option<PathBuf>,
    journal: Option<PathBuf>,
}

impl Cli {
    pub fn parse_and_build_config() -> Result<Config> {
        let c = <Cli as Parser>::parse();
        c.build_config(::config::Environment::with_prefix("OVMS"))
    }

    fn build_config(self, env: ::config::Environment) -> Result<Config> {
        let path_str = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().into_owned());

        let mut builder = ::config::Config::builder()
            .set_default("host", "127.0.0.1")?
            .set_default("port", i64::from(DEFAULT_RELAY_PORT))?
            .set_default("family", VehicleFamily::default().as_str())?
            .set_default("timeout_secs", DEFAULT_COMMAND_TIMEOUT.as_secs() as i64)?
            .set_default("keepalive_secs", DEFAULT_KEEPALIVE.as_secs() as i64)?
            .set_default("auth_failure_limit", i64::from(DEFAULT_AUTH_FAILURE_LIMIT))?;
        if let Some(file) = &self.config {
            builder = builder.add_source(::config::File::from(file.as_path()).required(true));
        }
        let settings: Settings = builder
            .add_source(env)
            .set_override_option("host", self.host.clone())?
            .set_override_option("port", self.port.map(i64::from))?
            .set_override_option("family", self.family.clone())?
            .set_override_option("secret_hex", self.secret_hex.clone())?
            .set_override_option("nonce_hex", self.nonce_hex.clone())?
            .set_override_option("timeout_secs", self.timeout_secs.map(|v| v as i64))?
            .set_override_option("keepalive_secs", self.keepalive_secs.map(|v| v as i64))?
            .set_override_option("auth_failure_limit", self.auth_failure_limit.map(i64::from))?
            .set_override_option("log_dir", path_str(&self.log_dir))?
            .set_override_option("journal", path_str(&self.journal))?
            .build()?
            .try_deserialize()
            .context("reading configuration")?;

        let family = settings
            .family
            .parse::<VehicleFamily>()
            .map_err(anyhow::Error::msg)?;
        let secret_hex = settings
            .secret_hex
            .context("no shared secret: pass --secret-hex or set OVMS_SECRET_HEX")?;
        let nonce_hex = settings
            .nonce_hex
            .context("no session nonce: pass --nonce-hex or set OVMS_NONCE_HEX")?;

        Ok(Config {
            relay_addr: format!("{}:{}", settings.host, settings.port),
            family,
            secret_hex,
            nonce_hex,
            command_timeout: Duration::from_secs(settings.timeout_secs),
            keepalive: (settings.keepalive_secs > 0).then(|| Duration::from_secs(settings.keepalive_secs)),
            auth_failure_limit: settings.auth_failure_limit,
            log_dir: settings.log_dir,
            journal: settings.journal,
            json: self.json,
            command: self.command.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ovms-command").chain(args.iter().copied())).unwrap()
    }

    fn no_env() -> ::config::Environment {
        ::config::Environment::with_prefix("OVMS").source(Some(HashMap::new()))
    }

    #[test]
    fn defaults_apply() {
        let cfg = cli(&["--secret-hex", "aa", "--nonce-hex", "bb", "climate-on"])
            .build_config(no_env())
            .unwrap();
        assert_eq!(cfg.relay_addr, "127.0.0.1:6867");
        assert_eq!(cfg.family, VehicleFamily::Standard);
        assert_eq!(cfg.command_timeout, Duration::from_secs(30));
        assert_eq!(cfg.keepalive, Some(Duration::from_secs(120)));
        assert_eq!(cfg.auth_failure_limit, 3);
        assert_eq!(cfg.command, Command::ClimateOn);
        assert!(!cfg.json);
    }

    #[test]
    fn environment_fills_gaps_and_flags_win() {
        let env = ::config::Environment::with_prefix("OVMS").source(Some(HashMap::from([
                ("OVMS_SECRET_HEX".to_string(), "aa".to_string()),
                ("OVMS_NONCE_HEX".to_string(), "bb".to_string()),
                ("OVMS_FAMILY".to_string(), "nl".to_string()),
                ("OVMS_PORT".to_string(), "7000".to_string()),
            ])));
        let cfg = cli(&["--family", "SQ", "--keepalive-secs", "0", "set-charge-limit", "80"])
            .build_config(env)
            .unwrap();
        assert_eq!(cfg.family, VehicleFamily::Sq);
        assert_eq!(cfg.relay_addr, "127.0.0.1:7000");
        assert_eq!(cfg.keepalive, None);
        assert_eq!(cfg.secret_hex, "aa");
        assert_eq!(cfg.command, Command::SetChargeLimit { percent: 80 });
    }

    #[test]
    fn missing_secret_is_an_error() {
        let err = cli(&["lock"]).build_config(no_env()).unwrap_err();
        assert!(err.to_string().contains("secret"), "{err}");
    }

    #[test]
    fn subcommand_arguments() {
        let c = cli(&["tpms-map-wheel", "rl", "0A1B2C"]);
        assert_eq!(
            Command::from(c.command),
            Command::TpmsMapWheel {
                wheel: Wheel::RearLeft,
                sensor: "0A1B2C".into()
            }
        );
        let c = cli(&["set-charge-timer", "23:05"]);
        assert_eq!(
            Command::from(c.command),
            Command::SetChargeTimer {
                start: NaiveTime::from_hms_opt(23, 5, 0)
            }
        );
        let c = cli(&["set-charge-timer"]);
        assert_eq!(Command::from(c.command), Command::SetChargeTimer { start: None });
        assert!(Cli::try_parse_from(["ovms-command", "tpms-map-wheel", "xx", "1"]).is_err());
    }
}
