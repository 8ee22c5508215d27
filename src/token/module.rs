//! The native token module interface.
//!
//! Everything the engine needs from a PKCS#11 library goes through the
//! [`TokenModule`] trait. Implementations translate native status codes into
//! [`Error`] values so that nothing above this layer ever sees them.
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use secrecy::SecretString;

use crate::commons::error::Error;
use crate::token::uri::{Manufacturer, Model, SerialNumber, SlotCriteria, TokenLabel};

//------------ Handles -------------------------------------------------------

pub type SlotId = u64;

/// An open session on a module.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An object found by a search, valid within the session that found it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//------------ SlotDescription -----------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokenDescription {
    pub label: TokenLabel,
    pub manufacturer: Manufacturer,
    pub model: Model,
    pub serial: SerialNumber,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlotDescription {
    pub id: SlotId,

    /// The token in the slot, if one is present.
    pub token: Option<TokenDescription>,
}

impl SlotDescription {
    /// Whether the slot holds a token matching every criterion given.
    ///
    /// Criteria that are absent match anything. Token fields compare the
    /// full, padded width.
    pub fn matches(&self, criteria: &SlotCriteria) -> bool {
        let Some(token) = &self.token else {
            return false;
        };

        criteria.slot_id.is_none_or(|id| id == self.id)
            && criteria.token.is_none_or(|label| label == token.label)
            && criteria.manufacturer.is_none_or(|m| m == token.manufacturer)
            && criteria.model.is_none_or(|model| model == token.model)
            && criteria.serial.is_none_or(|serial| serial == token.serial)
    }
}

/// Picks the first slot matching `criteria`, in module order.
pub fn select_slot<'a>(slots: &'a [SlotDescription], criteria: &SlotCriteria) -> Option<&'a SlotDescription> {
    slots.iter().find(|slot| slot.matches(criteria))
}

//------------ Objects -------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ObjectClass {
    Certificate,
    PublicKey,
    PrivateKey,
    Other,
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectClass::Certificate => write!(f, "certificate"),
            ObjectClass::PublicKey => write!(f, "public key"),
            ObjectClass::PrivateKey => write!(f, "private key"),
            ObjectClass::Other => write!(f, "object"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyType {
    Rsa,
    Ec,
    Other,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Rsa => write!(f, "RSA"),
            KeyType::Ec => write!(f, "EC"),
            KeyType::Other => write!(f, "unknown"),
        }
    }
}

/// The attribute template of an object search.
///
/// A search matches objects that have every attribute set here. An empty
/// filter matches everything visible to the session.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SearchFilter {
    pub class: Option<ObjectClass>,
    pub id: Option<Vec<u8>>,
    pub label: Option<Vec<u8>>,
}

/// The common attributes of a found object.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawObject {
    pub class: Option<ObjectClass>,
    pub id: Vec<u8>,
    pub label: Vec<u8>,

    /// `CKA_VALUE`, only read for certificates.
    pub value: Option<Vec<u8>>,
}

/// The public attributes of a key object.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyAttributes {
    pub key_type: Option<KeyType>,
    pub modulus: Option<Vec<u8>>,
    pub public_exponent: Option<Vec<u8>>,
    pub ec_params: Option<Vec<u8>>,
    pub ec_point: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignMechanism {
    /// Raw PKCS#1 v1.5, the caller supplies the DigestInfo.
    RsaPkcs,
    Sha256RsaPkcs,
    Sha384RsaPkcs,
    Sha512RsaPkcs,

    /// Raw ECDSA over a precomputed hash.
    Ecdsa,
}

//------------ TokenModule ---------------------------------------------------

/// A loaded native token module.
///
/// Modules are shared process-wide, so [`initialize`] and [`finalize`] are
/// counted: only the last finalize unloads module-level state.
///
/// [`initialize`]: TokenModule::initialize
/// [`finalize`]: TokenModule::finalize
pub trait TokenModule: Send + Sync {
    /// The library file name, for log messages.
    fn name(&self) -> &str;

    fn initialize(&self) -> Result<(), Error>;

    fn finalize(&self) -> Result<(), Error>;

    /// Lists all slots, with the token present in each.
    fn slots(&self) -> Result<Vec<SlotDescription>, Error>;

    fn open_session(&self, slot: SlotId, read_write: bool) -> Result<SessionHandle, Error>;

    fn close_session(&self, session: SessionHandle) -> Result<(), Error>;

    /// Logs the normal user in. A session that is already logged in is not
    /// an error.
    fn login(&self, session: SessionHandle, pin: Option<&SecretString>) -> Result<(), Error>;

    /// Starts an object search on the session.
    ///
    /// A session has at most one search active. Starting a second one
    /// without ending the first fails.
    fn find_objects_init(&self, session: SessionHandle, filter: &SearchFilter) -> Result<(), Error>;

    /// Returns up to `max` further matches of the active search.
    fn find_objects(&self, session: SessionHandle, max: usize) -> Result<Vec<ObjectHandle>, Error>;

    fn find_objects_final(&self, session: SessionHandle) -> Result<(), Error>;

    fn object_attributes(&self, session: SessionHandle, object: ObjectHandle) -> Result<RawObject, Error>;

    fn key_attributes(&self, session: SessionHandle, object: ObjectHandle) -> Result<KeyAttributes, Error>;

    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        mechanism: SignMechanism,
        data: &[u8],
    ) -> Result<Vec<u8>, Error>;

    /// Decrypts with RSA PKCS#1 v1.5.
    fn decrypt(&self, session: SessionHandle, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, Error>;
}

//------------ ModuleLoader --------------------------------------------------

/// Loads token modules by path.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn TokenModule>, Error>;
}

//------------ Tests ---------------------------------------------------------
