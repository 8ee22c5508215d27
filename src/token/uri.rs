//! Token URIs and the selectors parsed from them.
//!
//! A token URI looks like
//! `pkcs11:token=My%20Token;id=%01%02;type=private`. The attributes it may
//! carry are listed in [`Selector::parse`]. A string without the `pkcs11:`
//! prefix is taken as a raw, percent-encoded object id.
use std::fmt;
use std::path::{Path, PathBuf};

use log::trace;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode, percent_encode};
use secrecy::Secret;

use crate::commons::error::Error;
use crate::constants::{
    MANUFACTURER_LEN, MODEL_LEN, PIN_SOURCE_FILE_PREFIX, PKCS11_URI_PREFIX, SERIAL_LEN, TOKEN_LABEL_LEN,
};
use crate::token::pin::{self, PinSource};

/// Everything but the RFC 3986 unreserved characters gets encoded.
const URI_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Module paths keep their separators readable.
const URI_PATH_VALUE: &AsciiSet = &URI_VALUE.remove(b'/');

//------------ FixedField ----------------------------------------------------

/// A space padded, fixed width token info field.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct FixedField<const N: usize>([u8; N]);

impl<const N: usize> FixedField<N> {
    /// Pads `bytes` with spaces to `N` bytes, truncating longer input.
    pub fn pad(bytes: &[u8]) -> Self {
        let mut field = [b' '; N];
        let len = bytes.len().min(N);
        field[..len].copy_from_slice(&bytes[..len]);
        FixedField(field)
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    /// Returns the content without the trailing padding.
    pub fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().rposition(|&b| b != b' ').map(|pos| pos + 1).unwrap_or(0);
        &self.0[..end]
    }

    pub fn is_blank(&self) -> bool {
        self.trimmed().is_empty()
    }
}

impl<const N: usize> fmt::Debug for FixedField<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl<const N: usize> fmt::Display for FixedField<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.trimmed()))
    }
}

pub type TokenLabel = FixedField<TOKEN_LABEL_LEN>;
pub type Manufacturer = FixedField<MANUFACTURER_LEN>;
pub type Model = FixedField<MODEL_LEN>;
pub type SerialNumber = FixedField<SERIAL_LEN>;

//------------ ObjectType ----------------------------------------------------

/// The `type` attribute of a token URI.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ObjectType {
    Private,
    Public,
    Cert,
}

impl ObjectType {
    pub fn from_uri_value(value: &str) -> Option<Self> {
        match value {
            "private" => Some(ObjectType::Private),
            "public" => Some(ObjectType::Public),
            "cert" => Some(ObjectType::Cert),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Private => "private",
            ObjectType::Public => "public",
            ObjectType::Cert => "cert",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//------------ ParseMode -----------------------------------------------------

/// What a selector is parsed for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ParseMode {
    /// Loading a single object: an id or a label is required and a PIN is
    /// always needed.
    #[default]
    Object,

    /// Enumerating a store: id and label are optional and a PIN is only
    /// needed for private objects.
    Enumerate,
}

//------------ SlotCriteria --------------------------------------------------

/// The part of a selector that picks the module, slot and token.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SlotCriteria {
    pub module_path: Option<PathBuf>,
    pub slot_id: Option<u64>,
    pub token: Option<TokenLabel>,
    pub manufacturer: Option<Manufacturer>,
    pub model: Option<Model>,
    pub serial: Option<SerialNumber>,
}

//------------ Selector ------------------------------------------------------

/// The parsed form of a token URI.
#[derive(Clone, Default)]
pub struct Selector {
    mode: ParseMode,
    module_path: Option<PathBuf>,
    slot_id: Option<u64>,
    token: Option<TokenLabel>,
    manufacturer: Option<Manufacturer>,
    model: Option<Model>,
    serial: Option<SerialNumber>,
    id: Option<Vec<u8>>,
    label: Option<Vec<u8>>,
    object_type: Option<ObjectType>,
    pin: PinSource,
}

impl Selector {
    /// Creates an empty selector for the given mode.
    pub fn new(mode: ParseMode) -> Self {
        Selector {
            mode,
            ..Default::default()
        }
    }

    /// Parses a token URI.
    ///
    /// Recognised attributes are `pin-value`, `pin-source` (`file:` only),
    /// `object`, `model`, `serial`, `token`, `manufacturer`, `id`, `type`,
    /// `module-path` and `slot-id`. Unknown attributes are ignored. The
    /// object id, label, type, module path, slot id and PIN are taken from
    /// their first occurrence only, the token info fields from the last.
    ///
    /// A `pin-source` file is read here, so a bad path fails the parse.
    pub fn parse(uri: &str, mode: ParseMode) -> Result<Self, Error> {
        if uri.is_empty() {
            return Err(Error::EmptyUri);
        }

        let mut selector = Selector::new(mode);

        match uri.strip_prefix(PKCS11_URI_PREFIX) {
            Some(attributes) => {
                for item in attributes.split(';').filter(|item| !item.is_empty()) {
                    selector.apply_attribute(item)?;
                }
                if mode == ParseMode::Object && !selector.has_object() {
                    return Err(Error::MissingObject);
                }
            }
            None => {
                selector.id = Some(decode(uri)?);
            }
        }

        trace!("PKCS#11: Parsed '{}' into {:?}", redact(uri), selector);
        Ok(selector)
    }

    fn apply_attribute(&mut self, item: &str) -> Result<(), Error> {
        let Some((key, value)) = item.split_once('=') else {
            return Ok(());
        };

        match key {
            "pin-value" => {
                if self.pin.is_unset() {
                    self.pin = PinSource::Value(Secret::new(value.to_string()));
                }
            }
            "pin-source" => {
                if self.pin.is_unset() {
                    let path = value
                        .strip_prefix(PIN_SOURCE_FILE_PREFIX)
                        .ok_or_else(|| Error::UnsupportedPinSource(value.to_string()))?;
                    let path = PathBuf::from(decode_str(path)?);
                    self.pin = PinSource::Value(pin::read_pin_file(&path)?);
                }
            }
            "object" => {
                if self.label.is_none() {
                    self.label = Some(decode(value)?);
                }
            }
            "id" => {
                if self.id.is_none() {
                    self.id = Some(decode(value)?);
                }
            }
            "token" => self.token = non_blank(FixedField::pad(&decode(value)?)),
            "manufacturer" => self.manufacturer = non_blank(FixedField::pad(&decode(value)?)),
            "model" => self.model = non_blank(FixedField::pad(&decode(value)?)),
            "serial" => self.serial = non_blank(FixedField::pad(&decode(value)?)),
            "type" => {
                if self.object_type.is_none() {
                    self.object_type = ObjectType::from_uri_value(value);
                }
            }
            "module-path" => {
                if self.module_path.is_none() {
                    self.module_path = Some(PathBuf::from(decode_str(value)?));
                }
            }
            "slot-id" => {
                if self.slot_id.is_none() {
                    let slot_id = value
                        .parse::<u64>()
                        .map_err(|_| Error::InvalidSlotId(value.to_string()))?;
                    self.slot_id = Some(slot_id);
                }
            }
            _ => {
                trace!("PKCS#11: Ignoring unknown URI attribute '{}'", key);
            }
        }
        Ok(())
    }

    /// Renders the selector as a token URI, without any PIN.
    pub fn to_uri(&self) -> String {
        let mut items: Vec<String> = Vec::new();
        if let Some(token) = &self.token {
            items.push(format!("token={}", encode(token.trimmed())));
        }
        if let Some(manufacturer) = &self.manufacturer {
            items.push(format!("manufacturer={}", encode(manufacturer.trimmed())));
        }
        if let Some(model) = &self.model {
            items.push(format!("model={}", encode(model.trimmed())));
        }
        if let Some(serial) = &self.serial {
            items.push(format!("serial={}", encode(serial.trimmed())));
        }
        if let Some(slot_id) = self.slot_id {
            items.push(format!("slot-id={}", slot_id));
        }
        if let Some(label) = &self.label {
            items.push(format!("object={}", encode(label)));
        }
        if let Some(id) = &self.id {
            items.push(format!("id={}", encode(id)));
        }
        if let Some(object_type) = self.object_type {
            items.push(format!("type={}", object_type));
        }
        if let Some(path) = &self.module_path {
            let path = path.to_string_lossy();
            items.push(format!("module-path={}", percent_encode(path.as_bytes(), URI_PATH_VALUE)));
        }
        format!("{}{}", PKCS11_URI_PREFIX, items.join(";"))
    }
}

/// # Accessors
impl Selector {
    pub fn mode(&self) -> ParseMode {
        self.mode
    }

    pub fn module_path(&self) -> Option<&Path> {
        self.module_path.as_deref()
    }

    pub fn slot_id(&self) -> Option<u64> {
        self.slot_id
    }

    pub fn token(&self) -> Option<&TokenLabel> {
        self.token.as_ref()
    }

    pub fn manufacturer(&self) -> Option<&Manufacturer> {
        self.manufacturer.as_ref()
    }

    pub fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    pub fn serial(&self) -> Option<&SerialNumber> {
        self.serial.as_ref()
    }

    pub fn id(&self) -> Option<&[u8]> {
        self.id.as_deref()
    }

    pub fn label(&self) -> Option<&[u8]> {
        self.label.as_deref()
    }

    pub fn object_type(&self) -> Option<ObjectType> {
        self.object_type
    }

    pub fn pin(&self) -> &PinSource {
        &self.pin
    }

    /// Whether the selector names an object by a non-empty id or label.
    pub fn has_object(&self) -> bool {
        self.id.as_ref().is_some_and(|id| !id.is_empty())
            || self.label.as_ref().is_some_and(|label| !label.is_empty())
    }

    /// Whether resolving this selector needs the token PIN.
    ///
    /// Loading objects always logs in. Enumeration only does so for
    /// private objects.
    pub fn requires_pin(&self) -> bool {
        match self.mode {
            ParseMode::Object => true,
            ParseMode::Enumerate => self.object_type == Some(ObjectType::Private),
        }
    }

    pub fn slot_criteria(&self) -> SlotCriteria {
        SlotCriteria {
            module_path: self.module_path.clone(),
            slot_id: self.slot_id,
            token: self.token,
            manufacturer: self.manufacturer,
            model: self.model,
            serial: self.serial,
        }
    }
}

/// # Modifiers
impl Selector {
    /// Returns a selector for the same module, slot and token, without the
    /// object attributes.
    pub fn slot_selector(&self, mode: ParseMode) -> Selector {
        Selector {
            mode,
            module_path: self.module_path.clone(),
            slot_id: self.slot_id,
            token: self.token,
            manufacturer: self.manufacturer,
            model: self.model,
            serial: self.serial,
            id: None,
            label: None,
            object_type: None,
            pin: self.pin.clone(),
        }
    }

    pub fn with_object_type(mut self, object_type: ObjectType) -> Self {
        self.object_type = Some(object_type);
        self
    }

    pub fn with_id(mut self, id: Vec<u8>) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_label(mut self, label: Vec<u8>) -> Self {
        self.label = Some(label);
        self
    }

    pub fn with_module_path(mut self, path: PathBuf) -> Self {
        self.module_path = Some(path);
        self
    }

    pub fn with_pin_source(mut self, pin: PinSource) -> Self {
        self.pin = pin;
        self
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("mode", &self.mode)
            .field("module_path", &self.module_path)
            .field("slot_id", &self.slot_id)
            .field("token", &self.token)
            .field("manufacturer", &self.manufacturer)
            .field("model", &self.model)
            .field("serial", &self.serial)
            .field("id", &self.id.as_ref().map(hex::encode))
            .field("label", &self.label.as_ref().map(|l| String::from_utf8_lossy(l).into_owned()))
            .field("object_type", &self.object_type)
            .field("pin", &self.pin)
            .finish()
    }
}

//------------ Percent-encoding ----------------------------------------------

/// Percent-decodes a URI value.
///
/// Unlike [`percent_decode`] on its own, a `%` that isn't followed by two
/// hex digits is an error.
pub fn decode(value: &str) -> Result<Vec<u8>, Error> {
    let bytes = value.as_bytes();
    let mut pos = 0;
    while let Some(offset) = bytes[pos..].iter().position(|&b| b == b'%') {
        let start = pos + offset;
        let valid = bytes.len() > start + 2
            && bytes[start + 1].is_ascii_hexdigit()
            && bytes[start + 2].is_ascii_hexdigit();
        if !valid {
            return Err(Error::InvalidPercentEncoding(value.to_string()));
        }
        pos = start + 3;
    }
    Ok(percent_decode(bytes).collect())
}

fn decode_str(value: &str) -> Result<String, Error> {
    let bytes = decode(value)?;
    String::from_utf8(bytes).map_err(|_| Error::InvalidPercentEncoding(value.to_string()))
}

/// Percent-encodes a value with the minimal encoding.
pub fn encode(value: &[u8]) -> String {
    percent_encode(value, URI_VALUE).to_string()
}

fn non_blank<const N: usize>(field: FixedField<N>) -> Option<FixedField<N>> {
    if field.is_blank() { None } else { Some(field) }
}

/// Hides `pin-value` contents from log output.
fn redact(uri: &str) -> String {
    uri.split(';')
        .map(|item| {
            if item.starts_with("pin-value=") || item.starts_with("pkcs11:pin-value=") {
                let (key, _) = item.split_once('=').unwrap_or((item, ""));
                format!("{}=[REDACTED]", key)
            } else {
                item.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

//------------ Tests ---------------------------------------------------------
