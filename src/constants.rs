//! Various engine-wide constants.

use std::env;
use std::path::PathBuf;

//------------ Names ---------------------------------------------------------

/// The identifier hosts use to select the engine.
pub const ENGINE_ID: &str = "pkcs11";

/// The friendly name of the engine.
pub const ENGINE_NAME: &str = "PKCS#11 engine";

/// The friendly name of the `p11tool` binary.
pub const P11TOOL_APP: &str = "PKCS#11 Token Tool";

//------------ URIs ----------------------------------------------------------

/// The scheme prefix of a token URI, including the colon.
pub const PKCS11_URI_PREFIX: &str = "pkcs11:";

/// The only supported `pin-source` sub-scheme.
pub const PIN_SOURCE_FILE_PREFIX: &str = "file:";

//------------ Token Info Field Widths ---------------------------------------

/// Width of the space padded token label field.
pub const TOKEN_LABEL_LEN: usize = 32;

/// Width of the space padded manufacturer field.
pub const MANUFACTURER_LEN: usize = 32;

/// Width of the space padded model field.
pub const MODEL_LEN: usize = 16;

/// Width of the space padded serial number field.
pub const SERIAL_LEN: usize = 16;

//------------ PIN -----------------------------------------------------------

/// The longest PIN line read from a `pin-source` file.
pub const PIN_FILE_MAX_LINE: usize = 255;

/// The text shown when asking for a PIN interactively.
pub const PIN_PROMPT: &str = "Enter PIN for Token: ";

//------------ Environment Variables -----------------------------------------

/// The environment variable with the default PKCS#11 module path.
pub const PKCS11_ENV_MODULE_PATH: &str = "PKCS11_MODULE_PATH";

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file.
pub const P11ENGINE_ENV_LOG_LEVEL: &str = "P11ENGINE_LOG_LEVEL";

/// Returns the module path configured through the environment, if any.
pub fn env_module_path() -> Option<PathBuf> {
    env::var_os(PKCS11_ENV_MODULE_PATH)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}
