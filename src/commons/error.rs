//! Defines all engine errors.

use std::path::PathBuf;
use std::{fmt, io};

use openssl::error::ErrorStack;

//------------ ErrorKind -----------------------------------------------------

/// The broad class an [`Error`] belongs to.
///
/// Configuration, resource and token errors abort the operation at hand.
/// Decode errors are usually recovered from by skipping the offending
/// object. User errors come from PIN acquisition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Config,
    Resource,
    Token,
    Decode,
    User,
}

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // Configuration Issues
    //-----------------------------------------------------------------
    EmptyUri,

    /// A `%` in a URI value not followed by two hex digits.
    InvalidPercentEncoding(String),

    /// A `pin-source` using anything other than `file:`.
    UnsupportedPinSource(String),

    /// Neither an object id nor a label was given.
    MissingObject,

    MissingModulePath,

    InvalidSlotId(String),

    /// A control command the engine doesn't know.
    UnknownCommand(String),

    //-----------------------------------------------------------------
    // Resource Issues
    //-----------------------------------------------------------------
    PinFile(PathBuf, io::Error),

    IoError(io::Error),

    //-----------------------------------------------------------------
    // Token Issues
    //-----------------------------------------------------------------
    ModuleLoad(PathBuf, String),

    NoMatchingSlot,

    SessionOpen(String),

    Login(String),

    SearchStart(String),

    ObjectNotFound(String),

    UnsupportedKey(String),

    /// The search cursor was already closed.
    CursorClosed,

    /// Any other failure reported by the native module.
    Token(String),

    //-----------------------------------------------------------------
    // Decode Issues
    //-----------------------------------------------------------------
    CertificateDecode(String),

    OpenSslError(ErrorStack),

    //-----------------------------------------------------------------
    // User Interaction Issues
    //-----------------------------------------------------------------
    PinPrompt(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::EmptyUri
            | Error::InvalidPercentEncoding(_)
            | Error::UnsupportedPinSource(_)
            | Error::MissingObject
            | Error::MissingModulePath
            | Error::InvalidSlotId(_)
            | Error::UnknownCommand(_) => ErrorKind::Config,

            Error::IoError(_) => ErrorKind::Resource,

            // An unreadable PIN source fails the login like a wrong PIN.
            Error::PinFile(_, _)
            | Error::ModuleLoad(_, _)
            | Error::NoMatchingSlot
            | Error::SessionOpen(_)
            | Error::Login(_)
            | Error::SearchStart(_)
            | Error::ObjectNotFound(_)
            | Error::UnsupportedKey(_)
            | Error::CursorClosed
            | Error::Token(_) => ErrorKind::Token,

            Error::CertificateDecode(_) | Error::OpenSslError(_) => ErrorKind::Decode,

            Error::PinPrompt(_) => ErrorKind::User,
        }
    }

    pub fn token(e: impl fmt::Display) -> Self {
        Error::Token(e.to_string())
    }

    pub fn decode(e: impl fmt::Display) -> Self {
        Error::CertificateDecode(e.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::EmptyUri => write!(f, "URI is empty"),
            Error::InvalidPercentEncoding(value) => {
                write!(f, "Invalid percent-encoding in '{}'", value)
            }
            Error::UnsupportedPinSource(source) => {
                write!(f, "Unsupported pin-source '{}', only 'file:' is supported", source)
            }
            Error::MissingObject => write!(f, "URI names neither an object id nor an object label"),
            Error::MissingModulePath => write!(f, "No PKCS#11 module path configured"),
            Error::InvalidSlotId(value) => write!(f, "Invalid slot-id '{}'", value),
            Error::UnknownCommand(cmd) => write!(f, "Unknown control command '{}'", cmd),
            Error::PinFile(path, e) => write!(f, "Cannot read PIN from '{}': {}", path.display(), e),
            Error::IoError(e) => e.fmt(f),
            Error::ModuleLoad(path, e) => {
                write!(f, "Failed to load PKCS#11 module '{}': {}", path.display(), e)
            }
            Error::NoMatchingSlot => write!(f, "No slot with a matching token found"),
            Error::SessionOpen(e) => write!(f, "Failed to open session: {}", e),
            Error::Login(e) => write!(f, "Login failed: {}", e),
            Error::SearchStart(e) => write!(f, "Failed to start object search: {}", e),
            Error::ObjectNotFound(what) => write!(f, "No matching {} found on token", what),
            Error::UnsupportedKey(e) => write!(f, "Unsupported key: {}", e),
            Error::CursorClosed => write!(f, "Search cursor is closed"),
            Error::Token(e) => write!(f, "Token error: {}", e),
            Error::CertificateDecode(e) => write!(f, "Cannot decode certificate: {}", e),
            Error::OpenSslError(e) => write!(f, "OpenSsl Error: {}", e),
            Error::PinPrompt(e) => write!(f, "Cannot obtain PIN: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorStack> for Error {
    fn from(e: ErrorStack) -> Self {
        Error::OpenSslError(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_classified() {
        assert_eq!(Error::MissingObject.kind(), ErrorKind::Config);
        assert_eq!(Error::InvalidPercentEncoding("%zz".into()).kind(), ErrorKind::Config);
        assert_eq!(
            Error::PinFile(PathBuf::from("/nope"), io::Error::from(io::ErrorKind::NotFound)).kind(),
            ErrorKind::Token
        );
        assert_eq!(Error::NoMatchingSlot.kind(), ErrorKind::Token);
        assert_eq!(Error::decode("bad der").kind(), ErrorKind::Decode);
        assert_eq!(Error::PinPrompt("interrupted".into()).kind(), ErrorKind::User);
    }

    #[test]
    fn display_names_the_offending_value() {
        let msg = Error::UnsupportedPinSource("env:PIN".into()).to_string();
        assert!(msg.contains("env:PIN"));
    }
}
