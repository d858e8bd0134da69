use env_logger::{Builder, TimestampPrecision};
use log::LevelFilter;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Preset {
    Console,
    Systemd,
    Production,
    Development,
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "console" => Ok(Preset::Console),
            "systemd" => Ok(Preset::Systemd),
            "production" => Ok(Preset::Production),
            "development" => Ok(Preset::Development),
            _ => Err(format!(
                "unknown logger preset {}, available: console, systemd, production, development",
                s
            )),
        }
    }
}

impl Preset {
    fn builder(self) -> Builder {
        let mut b = Builder::new();
        match self {
            Preset::Console => {
                b.filter_level(LevelFilter::Info)
                    .format_timestamp(Some(TimestampPrecision::Seconds))
                    .format_target(false);
            }
            // journald records the time itself
            Preset::Systemd => {
                b.filter_level(LevelFilter::Info)
                    .format_timestamp(None)
                    .format_target(false);
            }
            Preset::Production => {
                b.filter_level(LevelFilter::Info).format_timestamp_millis();
            }
            Preset::Development => {
                b.filter_level(LevelFilter::Debug)
                    .format_timestamp_millis()
                    .format_module_path(true);
            }
        }
        b
    }
}

/// Installs the global logger. `RUST_LOG` is honoured, `level` overrides both it and the preset.
pub fn init(preset: Preset, level: Option<LevelFilter>) -> Result<(), log::SetLoggerError> {
    let mut b = preset.builder();
    b.parse_default_env();
    if let Some(level) = level {
        b.filter_level(level);
    }
    b.try_init()
}
