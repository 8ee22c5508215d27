//! Engine configuration and logging setup.
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt};

use log::LevelFilter;
use secrecy::SecretString;
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;

use crate::constants::*;

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn module_path() -> Option<PathBuf> {
        env_module_path()
    }

    fn pin_prompt() -> bool {
        true
    }

    pub fn log_level() -> LevelFilter {
        match env::var(P11ENGINE_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {}, using 'warn'",
                        P11ENGINE_ENV_LOG_LEVEL
                    );
                    LevelFilter::Warn
                }
            },
            _ => LevelFilter::Warn,
        }
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./p11engine.log")
    }

    fn syslog_facility() -> String {
        "user".to_string()
    }
}

//------------ EngineConfig --------------------------------------------------

/// The configuration an engine starts from.
///
/// Everything here can also be changed later through the engine's control
/// commands.
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// The PKCS#11 module to load when a URI doesn't name one.
    #[serde(default = "ConfigDefaults::module_path")]
    pub module_path: Option<PathBuf>,

    #[serde(default)]
    pub pin: Option<SecretString>,

    /// Whether the user may be asked for a PIN interactively.
    #[serde(default = "ConfigDefaults::pin_prompt")]
    pub pin_prompt: bool,

    #[serde(default)]
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            module_path: ConfigDefaults::module_path(),
            pin: None,
            pin_prompt: ConfigDefaults::pin_prompt(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let mut s = String::new();
        let mut f = File::open(file)?;
        f.read_to_string(&mut s)?;

        let c: EngineConfig = toml::from_str(&s)?;
        Ok(c)
    }
}

//------------ LogConfig -----------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "ConfigDefaults::log_level", deserialize_with = "de_level_filter")]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            log_level: ConfigDefaults::log_level(),
            log_type: ConfigDefaults::log_type(),
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
        }
    }
}

impl LogConfig {
    /// Installs the global logger. Can only succeed once per process.
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        let output: fern::Output = match self.log_type {
            LogType::Stderr => io::stderr().into(),
            LogType::File => fern::log_file(&self.log_file)
                .map_err(|e| {
                    ConfigError::Other(format!("Failed to open log file '{}': {}", self.log_file.display(), e))
                })?
                .into(),
            LogType::Syslog => self.syslog_output()?,
        };

        self.dispatch()
            .chain(output)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init logging: {}", e)))
    }

    /// Connects to the local syslog daemon.
    #[cfg(unix)]
    fn syslog_output(&self) -> Result<fern::Output, ConfigError> {
        let facility = Facility::from_str(&self.syslog_facility)
            .map_err(|_| ConfigError::Other(format!("Invalid syslog_facility '{}'", self.syslog_facility)))?;
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process: ENGINE_ID.to_string(),
            pid: std::process::id(),
        };

        syslog::unix(formatter)
            .map(fern::Output::from)
            .map_err(|e| ConfigError::Other(format!("Cannot connect to syslog: {}", e)))
    }

    #[cfg(not(unix))]
    fn syslog_output(&self) -> Result<fern::Output, ConfigError> {
        Err(ConfigError::other("Syslog is only supported on unix"))
    }

    fn dispatch(&self) -> fern::Dispatch {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} [{}] [{}] {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(self.log_level)
            // the cryptoki crate traces every native call
            .level_for("cryptoki", self.log_level.min(LevelFilter::Info))
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//------------ Tests ---------------------------------------------------------
