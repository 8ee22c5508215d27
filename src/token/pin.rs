//! PIN acquisition.
//!
//! A token PIN is either already known, set on the engine or given in the
//! URI through `pin-value` or a `pin-source` file read at parse time, or
//! asked for with an interactive prompt.
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use log::{debug, trace};
use secrecy::{ExposeSecret, Secret, SecretString};

use crate::commons::error::Error;
use crate::constants::{PIN_FILE_MAX_LINE, PIN_PROMPT};

//------------ PinSource -----------------------------------------------------

/// Where the PIN for a selector comes from.
#[derive(Default)]
pub enum PinSource {
    /// No PIN given, a prompt may be needed.
    #[default]
    Unset,

    /// The PIN itself.
    Value(SecretString),
}

impl PinSource {
    pub fn is_unset(&self) -> bool {
        matches!(self, PinSource::Unset)
    }
}

impl Clone for PinSource {
    fn clone(&self) -> Self {
        match self {
            PinSource::Unset => PinSource::Unset,
            PinSource::Value(pin) => PinSource::Value(duplicate(pin)),
        }
    }
}

impl fmt::Debug for PinSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinSource::Unset => write!(f, "Unset"),
            PinSource::Value(_) => write!(f, "Value([REDACTED])"),
        }
    }
}

/// Makes an independent copy of a secret.
pub fn duplicate(pin: &SecretString) -> SecretString {
    Secret::new(pin.expose_secret().clone())
}

//------------ PinPrompt -----------------------------------------------------

/// Asks the user for a PIN.
///
/// This is the seam to the host's prompt abstraction. Rendering the prompt
/// is up to the implementation.
pub trait PinPrompt: Send + Sync {
    fn prompt_pin(&self, prompt: &str) -> Result<SecretString, Error>;
}

/// Reads the PIN from the controlling terminal without echoing it.
#[cfg(feature = "console-prompt")]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsolePrompt;

#[cfg(feature = "console-prompt")]
impl PinPrompt for ConsolePrompt {
    fn prompt_pin(&self, prompt: &str) -> Result<SecretString, Error> {
        rpassword::prompt_password(prompt)
            .map(Secret::new)
            .map_err(|err| Error::PinPrompt(err.to_string()))
    }
}

/// Refuses to prompt, for unattended use.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPrompt;

impl PinPrompt for NoPrompt {
    fn prompt_pin(&self, _prompt: &str) -> Result<SecretString, Error> {
        Err(Error::PinPrompt("interactive PIN entry is disabled".to_string()))
    }
}

/// The prompt used when the host doesn't supply one.
pub fn default_prompt() -> Box<dyn PinPrompt> {
    #[cfg(feature = "console-prompt")]
    {
        Box::new(ConsolePrompt)
    }
    #[cfg(not(feature = "console-prompt"))]
    {
        Box::new(NoPrompt)
    }
}

//------------ PIN files -----------------------------------------------------

/// Reads a PIN from the first line of a file.
///
/// At most [`PIN_FILE_MAX_LINE`] bytes are read. The line terminator is
/// stripped, everything else is used verbatim. A multi-byte character cut
/// off by the length limit is dropped. Token logins take UTF-8 PINs, so a
/// line that isn't UTF-8 is an error.
pub fn read_pin_file(path: &Path) -> Result<SecretString, Error> {
    let pin_file_err = |e: io::Error| Error::PinFile(path.to_path_buf(), e);

    let file = File::open(path).map_err(pin_file_err)?;
    let mut reader = BufReader::new(file.take(PIN_FILE_MAX_LINE as u64));
    let mut line = Vec::new();
    let read = reader.read_until(b'\n', &mut line).map_err(pin_file_err)?;
    if read == 0 {
        return Err(pin_file_err(io::Error::new(io::ErrorKind::UnexpectedEof, "file is empty")));
    }

    if line.ends_with(b"\n") {
        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }
    }

    let pin = match String::from_utf8(line) {
        Ok(pin) => pin,
        Err(err) if err.utf8_error().error_len().is_none() && read == PIN_FILE_MAX_LINE => {
            let valid = err.utf8_error().valid_up_to();
            let mut bytes = err.into_bytes();
            bytes.truncate(valid);
            String::from_utf8(bytes).map_err(|err| pin_file_err(io::Error::new(io::ErrorKind::InvalidData, err)))?
        }
        Err(err) => {
            return Err(pin_file_err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("PIN is not valid UTF-8: {}", err),
            )));
        }
    };

    debug!("PKCS#11: Read PIN from '{}'", path.display());
    Ok(Secret::new(pin))
}

//------------ Resolution ----------------------------------------------------

/// Resolves the PIN described by `source`, prompting if there is none.
pub fn resolve_pin(source: &PinSource, prompt: &dyn PinPrompt) -> Result<SecretString, Error> {
    match source {
        PinSource::Value(pin) => Ok(duplicate(pin)),
        PinSource::Unset => {
            trace!("PKCS#11: Prompting for PIN");
            prompt.prompt_pin(PIN_PROMPT)
        }
    }
}

//------------ Tests ---------------------------------------------------------
