//! Module, slot and session management.
//!
//! A [`SessionContext`] belongs to one engine instance. It remembers the
//! module it loaded, the slot it picked, the session it opened on it and
//! the PIN it used, so that later operations on the same token can reuse
//! them.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use secrecy::SecretString;

use crate::commons::error::Error;
use crate::constants;
use crate::token::cryptoki::CryptokiLoader;
use crate::token::module::{ModuleLoader, SlotId, select_slot};
use crate::token::pin::{self, NoPrompt, PinPrompt, PinSource};
use crate::token::session::{LoadedModule, TokenSession};
use crate::token::uri::{Selector, SlotCriteria};

//------------ SessionContext ------------------------------------------------

pub struct SessionContext {
    loader: Arc<dyn ModuleLoader>,
    prompt: Box<dyn PinPrompt>,
    state: Mutex<ContextState>,
}

struct ContextState {
    /// The module path set on the engine.
    module_path: Option<PathBuf>,

    /// The PIN set on the engine, or resolved earlier.
    pin: Option<SecretString>,
    prompt_enabled: bool,

    module: Option<Arc<LoadedModule>>,
    slot: Option<SlotId>,

    /// The slot selection the primary session was opened for.
    criteria: Option<SlotCriteria>,
    session: Option<Arc<TokenSession>>,
}

impl SessionContext {
    pub fn new(loader: Arc<dyn ModuleLoader>, prompt: Box<dyn PinPrompt>) -> Self {
        SessionContext {
            loader,
            prompt,
            state: Mutex::new(ContextState {
                module_path: None,
                pin: None,
                prompt_enabled: true,
                module: None,
                slot: None,
                criteria: None,
                session: None,
            }),
        }
    }

    /// A context for native modules that prompts on the console.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(CryptokiLoader), pin::default_prompt())
    }

    fn state(&self) -> Result<MutexGuard<'_, ContextState>, Error> {
        self.state.lock().map_err(|_| Error::token("session context lock is poisoned"))
    }
}

/// # Configuration
impl SessionContext {
    pub fn set_module_path(&self, path: PathBuf) -> Result<(), Error> {
        debug!("PKCS#11: Module path set to '{}'", path.display());
        self.state()?.module_path = Some(path);
        Ok(())
    }

    pub fn module_path(&self) -> Result<Option<PathBuf>, Error> {
        Ok(self.state()?.module_path.clone())
    }

    pub fn set_pin(&self, pin: SecretString) -> Result<(), Error> {
        self.state()?.pin = Some(pin);
        Ok(())
    }

    /// Forgets the PIN, so that the next login resolves it again.
    pub fn clear_pin(&self) -> Result<(), Error> {
        self.state()?.pin = None;
        Ok(())
    }

    pub fn has_pin(&self) -> Result<bool, Error> {
        Ok(self.state()?.pin.is_some())
    }

    pub fn set_prompt_enabled(&self, enabled: bool) -> Result<(), Error> {
        self.state()?.prompt_enabled = enabled;
        Ok(())
    }
}

/// # Resolution
impl SessionContext {
    /// Returns the PIN to use for `selector`.
    ///
    /// A PIN known to the context wins over one given in the selector, and
    /// either wins over prompting. Whatever is found is kept for later use.
    /// The context isn't locked while the user is prompted.
    pub fn resolve_pin(&self, selector: &Selector) -> Result<SecretString, Error> {
        let prompt_enabled = {
            let state = self.state()?;
            if let Some(pin) = &state.pin {
                return Ok(pin::duplicate(pin));
            }
            state.prompt_enabled
        };

        let resolved = if prompt_enabled || !selector.pin().is_unset() {
            pin::resolve_pin(selector.pin(), self.prompt.as_ref())
        } else {
            pin::resolve_pin(&PinSource::Unset, &NoPrompt)
        }?;

        let mut state = self.state()?;
        match &state.pin {
            // Set by someone else while we were asking.
            Some(pin) => Ok(pin::duplicate(pin)),
            None => {
                state.pin = Some(pin::duplicate(&resolved));
                Ok(resolved)
            }
        }
    }

    /// Resolves the PIN if `selector` needs a login.
    fn pin_for(&self, selector: &Selector) -> Result<Option<SecretString>, Error> {
        if selector.requires_pin() {
            self.resolve_pin(selector).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Picks the module path: the selector's, then the engine's, then the
    /// environment's.
    fn module_path_for(state: &ContextState, selector: &Selector) -> Result<PathBuf, Error> {
        selector
            .module_path()
            .map(Path::to_path_buf)
            .or_else(|| state.module_path.clone())
            .or_else(constants::env_module_path)
            .ok_or(Error::MissingModulePath)
    }

    /// Loads and initializes the module for `selector`, or reuses the one
    /// already loaded from the same path.
    pub fn initialize(&self, selector: &Selector) -> Result<Arc<LoadedModule>, Error> {
        let mut state = self.state()?;
        self.initialize_locked(&mut state, selector)
    }

    fn initialize_locked(&self, state: &mut ContextState, selector: &Selector) -> Result<Arc<LoadedModule>, Error> {
        let path = Self::module_path_for(state, selector)?;

        if let Some(module) = &state.module {
            if module.path() == path {
                return Ok(module.clone());
            }
            debug!(
                "PKCS#11: Switching module from '{}' to '{}'",
                module.path().display(),
                path.display()
            );
            Self::end_session_locked(state);
            state.module = None;
        }

        let module = LoadedModule::load(self.loader.as_ref(), &path)?;
        state.module = Some(module.clone());
        Ok(module)
    }

    /// Returns the first slot with a token matching the selector.
    pub fn get_slot(&self, module: &LoadedModule, selector: &Selector) -> Result<SlotId, Error> {
        let slots = module.slots()?;
        let slot = select_slot(&slots, &selector.slot_criteria()).ok_or(Error::NoMatchingSlot)?;
        trace!("PKCS#11: Selected slot {}", slot.id);
        Ok(slot.id)
    }

    /// Opens a session on `slot`.
    pub fn start_session(
        &self,
        module: Arc<LoadedModule>,
        slot: SlotId,
        read_write: bool,
    ) -> Result<Arc<TokenSession>, Error> {
        TokenSession::open(module, slot, read_write).map(Arc::new)
    }

    /// Logs in to `session` if `selector` needs it.
    pub fn login(&self, session: &TokenSession, selector: &Selector) -> Result<(), Error> {
        if !selector.requires_pin() || session.is_logged_in() {
            return Ok(());
        }
        let pin = self.resolve_pin(selector)?;
        session.login(Some(&pin))
    }

    /// Returns the primary session for `selector`, logged in if needed.
    ///
    /// The session is kept and handed out again as long as later selectors
    /// pick the same module and slot. If any step fails, the session and
    /// module are released before the error is returned.
    pub fn acquire(&self, selector: &Selector) -> Result<Arc<TokenSession>, Error> {
        let res = self
            .pin_for(selector)
            .and_then(|pin| self.acquire_locked(&mut *self.state()?, selector, pin));
        if let Err(err) = &res {
            debug!("PKCS#11: Failed to acquire session: {}", err);
            Self::finalize_locked(&mut *self.state()?);
        }
        res
    }

    fn acquire_locked(
        &self,
        state: &mut ContextState,
        selector: &Selector,
        pin: Option<SecretString>,
    ) -> Result<Arc<TokenSession>, Error> {
        let mut criteria = selector.slot_criteria();
        criteria.module_path = Some(Self::module_path_for(state, selector)?);

        let reusable = state.criteria.as_ref() == Some(&criteria)
            && state.session.as_ref().is_some_and(|session| pin.is_none() || session.is_read_write());

        let session = match state.session.clone().filter(|_| reusable) {
            Some(session) => {
                trace!("PKCS#11: Reusing session {}", session.handle());
                session
            }
            None => {
                Self::end_session_locked(state);

                let module = self.initialize_locked(state, selector)?;
                let slot = self.get_slot(&module, selector)?;
                state.slot = Some(slot);

                let session = self.start_session(module, slot, true)?;
                state.session = Some(session.clone());
                state.criteria = Some(criteria);
                session
            }
        };

        if let Some(pin) = pin {
            session.login(Some(&pin))?;
        }
        Ok(session)
    }

    /// Opens a session for `selector` that is not shared with anything else.
    ///
    /// The module is shared with the primary session, the session itself
    /// belongs to the caller.
    pub fn open_dedicated_session(&self, selector: &Selector) -> Result<Arc<TokenSession>, Error> {
        let pin = self.pin_for(selector)?;

        let mut state = self.state()?;
        let module = self.initialize_locked(&mut state, selector)?;
        let slot = self.get_slot(&module, selector)?;
        let session = self.start_session(module, slot, pin.is_some())?;
        if let Some(pin) = pin {
            session.login(Some(&pin))?;
        }
        Ok(session)
    }
}

/// # Teardown
impl SessionContext {
    /// Closes the primary session, if any.
    pub fn end_session(&self) -> Result<(), Error> {
        Self::end_session_locked(&mut *self.state()?);
        Ok(())
    }

    fn end_session_locked(state: &mut ContextState) {
        state.criteria = None;
        state.slot = None;
        if state.session.take().is_some() {
            trace!("PKCS#11: Released primary session");
        }
    }

    /// Releases the primary session and the module. Safe to call at any
    /// point, including repeatedly.
    pub fn finalize(&self) -> Result<(), Error> {
        Self::finalize_locked(&mut *self.state()?);
        Ok(())
    }

    fn finalize_locked(state: &mut ContextState) {
        Self::end_session_locked(state);
        state.module = None;
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            Self::finalize_locked(state);
            state.pin = None;
        }
    }
}

//------------ Tests ---------------------------------------------------------
