//! A [`TokenModule`] backed by a PKCS#11 library loaded through `cryptoki`.
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::RvError;
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{self as ck, Attribute, AttributeType};
use cryptoki::session::{Session, UserType};
use cryptoki::types::AuthPin;
use lazy_static::lazy_static;
use log::{debug, error, trace, warn};
use secrecy::{ExposeSecret, SecretString};

use crate::commons::error::Error;
use crate::token::module::{
    KeyAttributes, KeyType, ModuleLoader, ObjectClass, ObjectHandle, RawObject, SearchFilter, SessionHandle,
    SignMechanism, SlotDescription, SlotId, TokenDescription, TokenModule,
};
use crate::token::uri::FixedField;

impl From<cryptoki::error::Error> for Error {
    fn from(e: cryptoki::error::Error) -> Self {
        Error::token(e)
    }
}

//------------ Registry ------------------------------------------------------

// Libraries are keyed by file name rather than full path, so that two copies
// of the same library at different locations are never both loaded into the
// process.
lazy_static! {
    static ref MODULES: Mutex<HashMap<String, Arc<CryptokiModule>>> = Mutex::new(HashMap::new());
}

/// Loads modules from the process-wide registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct CryptokiLoader;

impl ModuleLoader for CryptokiLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn TokenModule>, Error> {
        let module: Arc<dyn TokenModule> = CryptokiModule::get_or_register(path)?;
        Ok(module)
    }
}

//------------ CryptokiModule ------------------------------------------------

pub struct CryptokiModule {
    lib_file_name: String,
    lib_path: PathBuf,
    state: Mutex<ModuleState>,
}

#[derive(Default)]
struct ModuleState {
    ctx: Option<Pkcs11>,

    /// Outstanding initialize calls.
    users: usize,

    next_session: u64,
    sessions: HashMap<u64, SessionState>,
}

struct SessionState {
    session: Session,

    /// Objects found in this session, [`ObjectHandle`] indexes into it.
    objects: Vec<ck::ObjectHandle>,

    /// Matches of the active search not yet handed out.
    search: Option<VecDeque<ck::ObjectHandle>>,
}

impl CryptokiModule {
    fn get_or_register(lib_path: &Path) -> Result<Arc<Self>, Error> {
        let lib_file_name = lib_path
            .file_name()
            .ok_or_else(|| Error::ModuleLoad(lib_path.to_path_buf(), "path does not point to a file".to_string()))?
            .to_string_lossy()
            .to_string();

        let mut modules = MODULES
            .lock()
            .map_err(|_| Error::ModuleLoad(lib_path.to_path_buf(), "module registry is poisoned".to_string()))?;

        let module = modules.entry(lib_file_name).or_insert_with_key(|lib_file_name| {
            Arc::new(CryptokiModule {
                lib_file_name: lib_file_name.clone(),
                lib_path: lib_path.to_path_buf(),
                state: Mutex::new(ModuleState::default()),
            })
        });

        Ok(module.clone())
    }

    fn state(&self) -> Result<MutexGuard<'_, ModuleState>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::token(format!("state of module '{}' is poisoned", self.lib_file_name)))
    }

    fn ctx<'a>(&self, state: &'a ModuleState) -> Result<&'a Pkcs11, Error> {
        state
            .ctx
            .as_ref()
            .ok_or_else(|| Error::token(format!("module '{}' is not initialized", self.lib_file_name)))
    }
}

impl ModuleState {
    fn session(&mut self, handle: SessionHandle) -> Result<&mut SessionState, Error> {
        self.sessions
            .get_mut(&handle.0)
            .ok_or_else(|| Error::token(format!("unknown session {}", handle)))
    }
}

impl SessionState {
    fn object(&self, handle: ObjectHandle) -> Result<ck::ObjectHandle, Error> {
        usize::try_from(handle.0)
            .ok()
            .and_then(|idx| self.objects.get(idx))
            .copied()
            .ok_or_else(|| Error::token(format!("unknown object {}", handle)))
    }
}

impl TokenModule for CryptokiModule {
    fn name(&self) -> &str {
        &self.lib_file_name
    }

    fn initialize(&self) -> Result<(), Error> {
        let mut state = self.state()?;

        if state.ctx.is_none() {
            trace!("PKCS#11: Loading library '{}'", self.lib_path.display());
            let ctx = Pkcs11::new(&self.lib_path).map_err(|err| {
                error!("PKCS#11: Failed to load library '{}': {}", self.lib_path.display(), err);
                Error::ModuleLoad(self.lib_path.clone(), err.to_string())
            })?;

            match ctx.initialize(CInitializeArgs::OsThreads) {
                Ok(()) => {}
                Err(cryptoki::error::Error::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {
                    debug!("PKCS#11: Library '{}' was already initialized", self.lib_file_name);
                }
                Err(err) => {
                    error!("PKCS#11: Failed to initialize library '{}': {}", self.lib_file_name, err);
                    return Err(Error::ModuleLoad(self.lib_path.clone(), err.to_string()));
                }
            }

            state.ctx = Some(ctx);
        }

        state.users += 1;
        Ok(())
    }

    fn finalize(&self) -> Result<(), Error> {
        let mut state = self.state()?;

        state.users = state.users.saturating_sub(1);
        if state.users == 0 && state.ctx.is_some() {
            if !state.sessions.is_empty() {
                warn!(
                    "PKCS#11: Closing {} session(s) left open on '{}'",
                    state.sessions.len(),
                    self.lib_file_name
                );
                state.sessions.clear();
            }
            // Dropping the last context finalizes the library.
            state.ctx = None;
            debug!("PKCS#11: Finalized library '{}'", self.lib_file_name);
        }
        Ok(())
    }

    fn slots(&self) -> Result<Vec<SlotDescription>, Error> {
        let state = self.state()?;
        let ctx = self.ctx(&state)?;

        let mut res = Vec::new();
        for slot in ctx.get_all_slots()? {
            let token = match ctx.get_slot_info(slot) {
                Ok(info) if info.token_present() => {
                    let info = ctx.get_token_info(slot)?;
                    Some(TokenDescription {
                        label: FixedField::pad(info.label().as_bytes()),
                        manufacturer: FixedField::pad(info.manufacturer_id().as_bytes()),
                        model: FixedField::pad(info.model().as_bytes()),
                        serial: FixedField::pad(info.serial_number().as_bytes()),
                    })
                }
                Ok(_) => None,
                Err(err) => {
                    debug!("PKCS#11: Skipping slot {}: {}", slot.id(), err);
                    None
                }
            };
            res.push(SlotDescription { id: slot.id(), token });
        }

        trace!("PKCS#11: Library '{}' reports {} slot(s)", self.lib_file_name, res.len());
        Ok(res)
    }

    fn open_session(&self, slot_id: SlotId, read_write: bool) -> Result<SessionHandle, Error> {
        let mut state = self.state()?;
        let ctx = self.ctx(&state)?;

        let slot = ctx
            .get_slots_with_token()?
            .into_iter()
            .find(|slot| slot.id() == slot_id)
            .ok_or(Error::NoMatchingSlot)?;

        let session = if read_write {
            ctx.open_rw_session(slot)
        } else {
            ctx.open_ro_session(slot)
        }
        .map_err(|err| Error::SessionOpen(err.to_string()))?;

        state.next_session += 1;
        let handle = state.next_session;
        state.sessions.insert(
            handle,
            SessionState {
                session,
                objects: Vec::new(),
                search: None,
            },
        );

        trace!("PKCS#11: Opened session {} on slot {}", handle, slot_id);
        Ok(SessionHandle(handle))
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), Error> {
        // Session closes the native session on drop.
        match self.state()?.sessions.remove(&session.0) {
            Some(_) => Ok(()),
            None => Err(Error::token(format!("unknown session {}", session))),
        }
    }

    fn login(&self, session: SessionHandle, pin: Option<&SecretString>) -> Result<(), Error> {
        let mut state = self.state()?;
        let session = state.session(session)?;

        let pin = pin.map(|pin| AuthPin::new(pin.expose_secret().clone().into()));
        match session.session.login(UserType::User, pin.as_ref()) {
            Ok(()) => Ok(()),
            Err(cryptoki::error::Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => Ok(()),
            Err(err) => Err(Error::Login(err.to_string())),
        }
    }

    fn find_objects_init(&self, session: SessionHandle, filter: &SearchFilter) -> Result<(), Error> {
        let mut state = self.state()?;
        let session = state.session(session)?;

        if session.search.is_some() {
            return Err(Error::SearchStart("a search is already active".to_string()));
        }

        let mut template = Vec::new();
        match filter.class {
            Some(ObjectClass::Certificate) => template.push(Attribute::Class(ck::ObjectClass::CERTIFICATE)),
            Some(ObjectClass::PublicKey) => template.push(Attribute::Class(ck::ObjectClass::PUBLIC_KEY)),
            Some(ObjectClass::PrivateKey) => template.push(Attribute::Class(ck::ObjectClass::PRIVATE_KEY)),
            Some(ObjectClass::Other) | None => {}
        }
        if let Some(id) = &filter.id {
            template.push(Attribute::Id(id.clone()));
        }
        if let Some(label) = &filter.label {
            template.push(Attribute::Label(label.clone()));
        }

        // cryptoki runs init, find and final in one go, the matches are
        // handed out from here.
        let found = session
            .session
            .find_objects(&template)
            .map_err(|err| Error::SearchStart(err.to_string()))?;
        session.search = Some(found.into());
        Ok(())
    }

    fn find_objects(&self, session: SessionHandle, max: usize) -> Result<Vec<ObjectHandle>, Error> {
        let mut state = self.state()?;
        let session = state.session(session)?;

        let search = session
            .search
            .as_mut()
            .ok_or_else(|| Error::token("no search is active"))?;

        let take = max.min(search.len());
        let mut res = Vec::with_capacity(take);
        for object in search.drain(..take) {
            res.push(ObjectHandle(session.objects.len() as u64));
            session.objects.push(object);
        }
        Ok(res)
    }

    fn find_objects_final(&self, session: SessionHandle) -> Result<(), Error> {
        let mut state = self.state()?;
        state.session(session)?.search = None;
        Ok(())
    }

    fn object_attributes(&self, session: SessionHandle, object: ObjectHandle) -> Result<RawObject, Error> {
        let mut state = self.state()?;
        let session = state.session(session)?;
        let object = session.object(object)?;

        let mut res = RawObject::default();
        let attributes = session
            .session
            .get_attributes(object, &[AttributeType::Class, AttributeType::Id, AttributeType::Label])?;
        for attribute in attributes {
            match attribute {
                Attribute::Class(class) => res.class = Some(object_class(class)),
                Attribute::Id(id) => res.id = id,
                Attribute::Label(label) => res.label = label,
                _ => {}
            }
        }

        // Only certificates get their value read, key values are sensitive.
        if res.class == Some(ObjectClass::Certificate) {
            for attribute in session.session.get_attributes(object, &[AttributeType::Value])? {
                if let Attribute::Value(value) = attribute {
                    res.value = Some(value);
                }
            }
        }

        Ok(res)
    }

    fn key_attributes(&self, session: SessionHandle, object: ObjectHandle) -> Result<KeyAttributes, Error> {
        let mut state = self.state()?;
        let session = state.session(session)?;
        let object = session.object(object)?;

        let attributes = session.session.get_attributes(
            object,
            &[
                AttributeType::KeyType,
                AttributeType::Modulus,
                AttributeType::PublicExponent,
                AttributeType::EcParams,
                AttributeType::EcPoint,
            ],
        )?;

        let mut res = KeyAttributes::default();
        for attribute in attributes {
            match attribute {
                Attribute::KeyType(key_type) => res.key_type = Some(key_type_of(key_type)),
                Attribute::Modulus(modulus) => res.modulus = Some(modulus),
                Attribute::PublicExponent(exponent) => res.public_exponent = Some(exponent),
                Attribute::EcParams(params) => res.ec_params = Some(params),
                Attribute::EcPoint(point) => res.ec_point = Some(point),
                _ => {}
            }
        }
        Ok(res)
    }

    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        mechanism: SignMechanism,
        data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mut state = self.state()?;
        let session = state.session(session)?;
        let key = session.object(key)?;

        let mechanism = match mechanism {
            SignMechanism::RsaPkcs => Mechanism::RsaPkcs,
            SignMechanism::Sha256RsaPkcs => Mechanism::Sha256RsaPkcs,
            SignMechanism::Sha384RsaPkcs => Mechanism::Sha384RsaPkcs,
            SignMechanism::Sha512RsaPkcs => Mechanism::Sha512RsaPkcs,
            SignMechanism::Ecdsa => Mechanism::Ecdsa,
        };

        Ok(session.session.sign(&mechanism, key, data)?)
    }

    fn decrypt(&self, session: SessionHandle, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut state = self.state()?;
        let session = state.session(session)?;
        let key = session.object(key)?;

        Ok(session.session.decrypt(&Mechanism::RsaPkcs, key, data)?)
    }
}

fn object_class(class: ck::ObjectClass) -> ObjectClass {
    if class == ck::ObjectClass::CERTIFICATE {
        ObjectClass::Certificate
    } else if class == ck::ObjectClass::PUBLIC_KEY {
        ObjectClass::PublicKey
    } else if class == ck::ObjectClass::PRIVATE_KEY {
        ObjectClass::PrivateKey
    } else {
        ObjectClass::Other
    }
}

fn key_type_of(key_type: ck::KeyType) -> KeyType {
    if key_type == ck::KeyType::RSA {
        KeyType::Rsa
    } else if key_type == ck::KeyType::EC {
        KeyType::Ec
    } else {
        KeyType::Other
    }
}

//------------ Tests ---------------------------------------------------------
