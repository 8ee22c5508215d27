//! The `p11tool` command line client.
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::{env, fmt};

use log::{LevelFilter, info};
use openssl::hash::{MessageDigest, hash};
use openssl::x509::X509NameRef;
use secrecy::SecretString;

use crate::commons::error::Error;
use crate::config::{ConfigError, EngineConfig};
use crate::constants::{P11ENGINE_ENV_LOG_LEVEL, P11TOOL_APP};
use crate::engine::{Engine, StoreItem};
use crate::token::TokenKey;
use crate::token::key::DigestAlgorithm;

//------------ Options -------------------------------------------------------

#[derive(clap::Parser)]
#[command(version, about = P11TOOL_APP)]
pub struct Options {
    /// Path to the engine configuration file
    #[arg(long, short, value_name = "path", global = true)]
    config: Option<PathBuf>,

    /// The PKCS#11 module to load
    #[arg(long, short, value_name = "path", global = true)]
    module: Option<PathBuf>,

    /// The token PIN
    #[arg(long, value_name = "pin", env = "P11TOOL_PIN", hide_env_values = true, global = true)]
    pin: Option<String>,

    /// The log level, overrides the configuration file
    #[arg(long, value_name = "level", value_parser = parse_level, global = true)]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Command,
}

fn parse_level(level: &str) -> Result<LevelFilter, String> {
    level.parse().map_err(|_| format!("invalid log level '{}'", level))
}

impl Options {
    pub fn from_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    pub fn try_from_iter<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as clap::Parser>::try_parse_from(args)
    }

    /// Builds the engine configuration from the config file and options.
    pub fn engine_config(&self) -> Result<EngineConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::read_config(path).map_err(|e| CliError::Config(path.clone(), e))?,
            None => {
                let mut config = EngineConfig::default();
                if env::var_os(P11ENGINE_ENV_LOG_LEVEL).is_none() {
                    config.log.log_level = LevelFilter::Info;
                }
                config
            }
        };

        if let Some(path) = &self.module {
            config.module_path = Some(path.clone());
        }
        if let Some(pin) = &self.pin {
            config.pin = Some(SecretString::new(pin.clone()));
        }
        if let Some(level) = self.log_level {
            config.log.log_level = level;
        }
        Ok(config)
    }

    /// Runs the command, writing its report to stdout.
    pub fn run(self) -> Result<(), CliError> {
        let config = self.engine_config()?;
        config.log.init_logging().map_err(CliError::Logging)?;

        let engine = Engine::from_config(&config)?;
        info!("{} using engine '{}'", P11TOOL_APP, engine.id());

        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.command.run(&engine, &mut out)
    }
}

//------------ Command -------------------------------------------------------

#[derive(clap::Subcommand)]
pub enum Command {
    /// List the objects a URI matches
    List(List),

    /// Show a certificate in PEM format
    Cert(Cert),

    /// Show a public key in PEM format
    Pubkey(Pubkey),

    /// Sign a file with a private key on the token
    Sign(Sign),
}

impl Command {
    pub fn run(self, engine: &Engine, out: &mut dyn Write) -> Result<(), CliError> {
        match self {
            Self::List(cmd) => cmd.run(engine, out),
            Self::Cert(cmd) => cmd.run(engine, out),
            Self::Pubkey(cmd) => cmd.run(engine, out),
            Self::Sign(cmd) => cmd.run(engine),
        }
    }
}

//------------ List ----------------------------------------------------------

#[derive(clap::Parser)]
pub struct List {
    /// The token URI, e.g. "pkcs11:token=MyToken"
    uri: String,
}

impl List {
    fn run(self, engine: &Engine, out: &mut dyn Write) -> Result<(), CliError> {
        let mut store = engine.open_store(&self.uri)?;
        for item in &mut store {
            let line = match item? {
                StoreItem::Name { name, description } => format!("{}\n    {}", name, description),
                StoreItem::Certificate(cert) => format!("certificate: {}", name_to_string(cert.subject_name())),
                StoreItem::PublicKey(key) => describe_key("public key", &key),
                StoreItem::PrivateKey(key) => describe_key("private key", &key),
            };
            writeln!(out, "{}", line).map_err(CliError::Output)?;
        }
        store.close();
        Ok(())
    }
}

fn describe_key(class: &str, key: &TokenKey) -> String {
    format!(
        "{} ({}): id {} label '{}'",
        class,
        key.key_type(),
        hex::encode(key.id()),
        String::from_utf8_lossy(key.label())
    )
}

/// Renders a name as `CN=..., O=...`.
fn name_to_string(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let data = entry.data().as_slice();
            let value = match std::str::from_utf8(data) {
                Ok(value) => value.to_string(),
                Err(_) => hex::encode(data),
            };
            format!("{}={}", key, value)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

//------------ Cert ----------------------------------------------------------

#[derive(clap::Parser)]
pub struct Cert {
    /// The token URI of the certificate
    uri: String,

    /// Write the PEM to this file instead of stdout
    #[arg(long, value_name = "path")]
    out: Option<PathBuf>,
}

impl Cert {
    fn run(self, engine: &Engine, out: &mut dyn Write) -> Result<(), CliError> {
        let pem = engine.load_certificate(&self.uri)?.to_pem().map_err(Error::from)?;
        match &self.out {
            Some(path) => write_file(path, &pem),
            None => out.write_all(&pem).map_err(CliError::Output),
        }
    }
}

//------------ Pubkey --------------------------------------------------------

#[derive(clap::Parser)]
pub struct Pubkey {
    /// The token URI of the public key
    uri: String,
}

impl Pubkey {
    fn run(self, engine: &Engine, out: &mut dyn Write) -> Result<(), CliError> {
        let key = engine.load_public_key(&self.uri)?;
        let public_key = key
            .public_key()
            .ok_or_else(|| Error::UnsupportedKey(format!("token doesn't expose the {} public key", key.key_type())))?;
        let pem = public_key.public_key_to_pem().map_err(Error::from)?;
        out.write_all(&pem).map_err(CliError::Output)
    }
}

//------------ Sign ----------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum Digest {
    Sha256,
    Sha384,
    Sha512,
}

impl Digest {
    fn message_digest(self) -> MessageDigest {
        match self {
            Digest::Sha256 => MessageDigest::sha256(),
            Digest::Sha384 => MessageDigest::sha384(),
            Digest::Sha512 => MessageDigest::sha512(),
        }
    }

    fn algorithm(self) -> DigestAlgorithm {
        match self {
            Digest::Sha256 => DigestAlgorithm::Sha256,
            Digest::Sha384 => DigestAlgorithm::Sha384,
            Digest::Sha512 => DigestAlgorithm::Sha512,
        }
    }
}

#[derive(clap::Parser)]
pub struct Sign {
    /// The token URI of the private key
    uri: String,

    /// The file to sign
    #[arg(long = "in", value_name = "path")]
    input: PathBuf,

    /// Where to write the signature
    #[arg(long, value_name = "path")]
    out: PathBuf,

    #[arg(long, value_enum, default_value = "sha256")]
    digest: Digest,
}

impl Sign {
    fn run(self, engine: &Engine) -> Result<(), CliError> {
        let mut data = Vec::new();
        File::open(&self.input)
            .and_then(|mut file| file.read_to_end(&mut data))
            .map_err(|e| CliError::File(self.input.clone(), e))?;

        let digest = hash(self.digest.message_digest(), &data).map_err(Error::from)?;
        let key = engine.load_private_key(&self.uri)?;
        let signature = key.sign_digest(self.digest.algorithm(), &digest)?;

        write_file(&self.out, &signature)?;
        info!("Signed '{}' with {}, signature in '{}'", self.input.display(), self.digest.algorithm(), self.out.display());
        Ok(())
    }
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), CliError> {
    File::create(path)
        .and_then(|mut file| file.write_all(content))
        .map_err(|e| CliError::File(path.to_path_buf(), e))
}

//------------ CliError ------------------------------------------------------

#[derive(Debug)]
pub enum CliError {
    Config(PathBuf, ConfigError),
    Logging(ConfigError),
    Engine(Error),
    File(PathBuf, io::Error),
    Output(io::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CliError::Config(path, e) => write!(f, "Error parsing config file: {}, error: {}", path.display(), e),
            CliError::Logging(e) => e.fmt(f),
            CliError::Engine(e) => e.fmt(f),
            CliError::File(path, e) => write!(f, "Cannot access '{}': {}", path.display(), e),
            CliError::Output(e) => write!(f, "Cannot write output: {}", e),
        }
    }
}

impl std::error::Error for CliError {}

impl From<Error> for CliError {
    fn from(e: Error) -> Self {
        CliError::Engine(e)
    }
}

//------------ Tests ---------------------------------------------------------
