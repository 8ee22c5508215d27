//! Owned handles for initialized modules and open sessions.
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use log::{debug, trace, warn};
use secrecy::SecretString;

use crate::commons::error::Error;
use crate::token::module::{
    KeyAttributes, ModuleLoader, ObjectHandle, RawObject, SearchFilter, SessionHandle, SignMechanism, SlotId,
    TokenModule,
};

//------------ LoadedModule --------------------------------------------------

/// An initialized token module.
///
/// Holds one initialize count on the module and gives it back on drop.
/// Sessions keep their module alive, so the module is never finalized
/// while a session on it is open.
pub struct LoadedModule {
    module: Arc<dyn TokenModule>,
    path: PathBuf,
}

impl LoadedModule {
    pub fn load(loader: &dyn ModuleLoader, path: &Path) -> Result<Arc<Self>, Error> {
        let module = loader.load(path)?;
        module.initialize()?;
        debug!("PKCS#11: Initialized module '{}'", module.name());

        Ok(Arc::new(LoadedModule {
            module,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Deref for LoadedModule {
    type Target = dyn TokenModule;

    fn deref(&self) -> &Self::Target {
        self.module.as_ref()
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        if let Err(err) = self.module.finalize() {
            warn!("PKCS#11: Failed to finalize module '{}': {}", self.module.name(), err);
        }
    }
}

//------------ TokenSession --------------------------------------------------

/// An open session on a slot, closed on drop.
///
/// We don't log out explicitly: closing the last session on a token returns
/// it to the public state.
///
/// A session runs one object search at a time. Searches go through a
/// [`SearchLock`], so callers sharing a session take turns.
pub struct TokenSession {
    module: Arc<LoadedModule>,
    slot: SlotId,
    handle: SessionHandle,
    read_write: bool,
    logged_in: AtomicBool,

    searching: Mutex<bool>,
    search_done: Condvar,
}

impl TokenSession {
    pub fn open(module: Arc<LoadedModule>, slot: SlotId, read_write: bool) -> Result<Self, Error> {
        let handle = module.open_session(slot, read_write)?;
        trace!("PKCS#11: Session {} open on slot {} (rw: {})", handle, slot, read_write);

        Ok(TokenSession {
            module,
            slot,
            handle,
            read_write,
            logged_in: AtomicBool::new(false),
            searching: Mutex::new(false),
            search_done: Condvar::new(),
        })
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn is_read_write(&self) -> bool {
        self.read_write
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    /// Logs the user in, unless this session already did.
    pub fn login(&self, pin: Option<&SecretString>) -> Result<(), Error> {
        if self.is_logged_in() {
            trace!("PKCS#11: Session {} is already logged in", self.handle);
            return Ok(());
        }

        self.module.login(self.handle, pin)?;
        self.logged_in.store(true, Ordering::SeqCst);
        debug!("PKCS#11: Logged in to slot {}", self.slot);
        Ok(())
    }

    pub fn find_objects_init(&self, filter: &SearchFilter) -> Result<(), Error> {
        self.module.find_objects_init(self.handle, filter)
    }

    pub fn find_objects(&self, max: usize) -> Result<Vec<ObjectHandle>, Error> {
        self.module.find_objects(self.handle, max)
    }

    pub fn find_objects_final(&self) -> Result<(), Error> {
        self.module.find_objects_final(self.handle)
    }

    pub fn object_attributes(&self, object: ObjectHandle) -> Result<RawObject, Error> {
        self.module.object_attributes(self.handle, object)
    }

    pub fn key_attributes(&self, object: ObjectHandle) -> Result<KeyAttributes, Error> {
        self.module.key_attributes(self.handle, object)
    }

    pub fn sign(&self, key: ObjectHandle, mechanism: SignMechanism, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.module.sign(self.handle, key, mechanism, data)
    }

    pub fn decrypt(&self, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.module.decrypt(self.handle, key, data)
    }
}

impl fmt::Debug for TokenSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSession")
            .field("module", &self.module.path())
            .field("slot", &self.slot)
            .field("handle", &self.handle)
            .field("read_write", &self.read_write)
            .field("logged_in", &self.is_logged_in())
            .finish()
    }
}

impl Drop for TokenSession {
    fn drop(&mut self) {
        match self.module.close_session(self.handle) {
            Ok(()) => trace!("PKCS#11: Closed session {}", self.handle),
            Err(err) => warn!("PKCS#11: Failed to close session {}: {}", self.handle, err),
        }
    }
}

//------------ SearchLock ----------------------------------------------------

/// Exclusive use of the object search of a session.
///
/// Acquiring blocks while another holder searches on the same session.
/// The lock is given back on drop.
pub struct SearchLock {
    session: Arc<TokenSession>,
}

impl SearchLock {
    pub fn acquire(session: Arc<TokenSession>) -> Self {
        let mut searching = session.searching.lock().unwrap_or_else(PoisonError::into_inner);
        while *searching {
            trace!("PKCS#11: Waiting for the search on session {}", session.handle);
            searching = session
                .search_done
                .wait(searching)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *searching = true;
        drop(searching);

        SearchLock { session }
    }
}

impl Drop for SearchLock {
    fn drop(&mut self) {
        *self.session.searching.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.session.search_done.notify_one();
    }
}
