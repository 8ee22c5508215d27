//! Object search and classification.
//!
//! A [`SearchCursor`] walks the objects matching a selector, one native
//! `find_objects` call per step, in the order the module reports them.
use std::fmt;
use std::sync::Arc;

use log::{debug, trace, warn};
use openssl::x509::X509;

use crate::commons::error::Error;
use crate::token::module::{ObjectClass, ObjectHandle, SearchFilter};
use crate::token::session::{SearchLock, TokenSession};
use crate::token::uri::{ObjectType, Selector};

//------------ TokenObject ---------------------------------------------------

/// A key object, not yet materialized.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyObject {
    pub handle: ObjectHandle,
    pub id: Vec<u8>,
    pub label: Vec<u8>,
}

/// A classified object.
pub enum TokenObject {
    Certificate { id: Vec<u8>, label: Vec<u8>, cert: X509 },
    PublicKey(KeyObject),
    PrivateKey(KeyObject),
}

impl TokenObject {
    pub fn id(&self) -> &[u8] {
        match self {
            TokenObject::Certificate { id, .. } => id,
            TokenObject::PublicKey(key) | TokenObject::PrivateKey(key) => &key.id,
        }
    }

    pub fn label(&self) -> &[u8] {
        match self {
            TokenObject::Certificate { label, .. } => label,
            TokenObject::PublicKey(key) | TokenObject::PrivateKey(key) => &key.label,
        }
    }

    pub fn class(&self) -> ObjectClass {
        match self {
            TokenObject::Certificate { .. } => ObjectClass::Certificate,
            TokenObject::PublicKey(_) => ObjectClass::PublicKey,
            TokenObject::PrivateKey(_) => ObjectClass::PrivateKey,
        }
    }
}

impl fmt::Debug for TokenObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenObject")
            .field("class", &self.class())
            .field("id", &hex::encode(self.id()))
            .field("label", &String::from_utf8_lossy(self.label()))
            .finish()
    }
}

/// A listing entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectName {
    /// A token URI naming the object.
    pub name: String,
    pub description: String,
}

//------------ Filters -------------------------------------------------------

fn class_for(object_type: ObjectType) -> ObjectClass {
    match object_type {
        ObjectType::Private => ObjectClass::PrivateKey,
        ObjectType::Public => ObjectClass::PublicKey,
        ObjectType::Cert => ObjectClass::Certificate,
    }
}

fn type_for(class: ObjectClass) -> Option<ObjectType> {
    match class {
        ObjectClass::PrivateKey => Some(ObjectType::Private),
        ObjectClass::PublicKey => Some(ObjectType::Public),
        ObjectClass::Certificate => Some(ObjectType::Cert),
        ObjectClass::Other => None,
    }
}

/// Builds the search template for a selector.
///
/// Empty ids and labels don't filter.
pub fn search_filter(selector: &Selector) -> SearchFilter {
    SearchFilter {
        class: selector.object_type().map(class_for),
        id: selector.id().filter(|id| !id.is_empty()).map(|id| id.to_vec()),
        label: selector.label().filter(|label| !label.is_empty()).map(|label| label.to_vec()),
    }
}

//------------ SearchCursor --------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CursorMode {
    /// Classify and materialize each object.
    Objects,

    /// Only list names.
    Names,
}

/// A search over the objects of one session.
///
/// The cursor holds the session's [`SearchLock`] from its first
/// `search_start` until it is closed, so searches restarted on the same
/// cursor stay in one turn.
pub struct SearchCursor {
    session: Option<Arc<TokenSession>>,
    lock: Option<SearchLock>,
    mode: CursorMode,

    /// The selector the active search was built from.
    selector: Option<Selector>,
    searching: bool,
    eof: bool,
}

impl SearchCursor {
    pub fn new(session: Arc<TokenSession>, mode: CursorMode) -> Self {
        SearchCursor {
            session: Some(session),
            lock: None,
            mode,
            selector: None,
            searching: false,
            eof: false,
        }
    }

    pub fn mode(&self) -> CursorMode {
        self.mode
    }

    pub fn session(&self) -> Result<&Arc<TokenSession>, Error> {
        self.session.as_ref().ok_or(Error::CursorClosed)
    }

    /// Whether the last step found no further object.
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Starts a search, ending any search already active on this cursor.
    pub fn search_start(&mut self, selector: &Selector) -> Result<(), Error> {
        self.end_search();

        let session = self.session()?.clone();
        if self.lock.is_none() {
            self.lock = Some(SearchLock::acquire(session.clone()));
        }

        let filter = search_filter(selector);
        trace!("PKCS#11: Starting search with {:?}", filter);

        session.find_objects_init(&filter).map_err(|err| match err {
            Error::SearchStart(_) => err,
            other => Error::SearchStart(other.to_string()),
        })?;

        self.selector = Some(selector.clone());
        self.searching = true;
        self.eof = false;
        Ok(())
    }

    fn end_search(&mut self) {
        if !self.searching {
            return;
        }
        self.searching = false;
        if let Some(session) = &self.session {
            if let Err(err) = session.find_objects_final() {
                debug!("PKCS#11: Failed to end search: {}", err);
            }
        }
    }

    /// Fetches the next raw match, ending the search when there is none.
    fn next_handle(&mut self) -> Result<Option<ObjectHandle>, Error> {
        if !self.searching {
            if self.session.is_none() {
                return Err(Error::CursorClosed);
            }
            self.eof = true;
            return Ok(None);
        }

        let session = self.session()?.clone();
        match session.find_objects(1)?.into_iter().next() {
            Some(handle) => Ok(Some(handle)),
            None => {
                self.eof = true;
                self.end_search();
                Ok(None)
            }
        }
    }

    fn permitted(&self, class: ObjectClass) -> bool {
        match self.selector.as_ref().and_then(Selector::object_type) {
            Some(object_type) => class == class_for(object_type),
            None => class != ObjectClass::Other,
        }
    }

    /// Returns the next matching object, or `None` once exhausted.
    ///
    /// Certificates that don't decode are logged and skipped, as are
    /// objects of classes the selector doesn't ask for.
    pub fn search_next_object(&mut self) -> Result<Option<TokenObject>, Error> {
        loop {
            let Some(handle) = self.next_handle()? else {
                return Ok(None);
            };

            let session = self.session()?.clone();
            let raw = session.object_attributes(handle)?;
            let class = raw.class.unwrap_or(ObjectClass::Other);
            if !self.permitted(class) {
                trace!("PKCS#11: Skipping {} with id {}", class, hex::encode(&raw.id));
                continue;
            }

            let object = match class {
                ObjectClass::Certificate => {
                    let decoded = raw
                        .value
                        .as_deref()
                        .ok_or_else(|| Error::decode("no value"))
                        .and_then(|der| X509::from_der(der).map_err(Error::decode));
                    match decoded {
                        Ok(cert) => TokenObject::Certificate {
                            id: raw.id,
                            label: raw.label,
                            cert,
                        },
                        Err(err) => {
                            warn!(
                                "PKCS#11: Skipping certificate '{}' (id {}): {}",
                                String::from_utf8_lossy(&raw.label),
                                hex::encode(&raw.id),
                                err
                            );
                            continue;
                        }
                    }
                }
                ObjectClass::PublicKey => TokenObject::PublicKey(KeyObject {
                    handle,
                    id: raw.id,
                    label: raw.label,
                }),
                ObjectClass::PrivateKey => TokenObject::PrivateKey(KeyObject {
                    handle,
                    id: raw.id,
                    label: raw.label,
                }),
                ObjectClass::Other => continue,
            };

            return Ok(Some(object));
        }
    }

    /// Returns the name and description of the next matching object.
    pub fn search_next_ids(&mut self) -> Result<Option<ObjectName>, Error> {
        loop {
            let Some(handle) = self.next_handle()? else {
                return Ok(None);
            };

            let session = self.session()?.clone();
            let raw = session.object_attributes(handle)?;
            let class = raw.class.unwrap_or(ObjectClass::Other);
            let Some(object_type) = type_for(class).filter(|_| self.permitted(class)) else {
                continue;
            };

            let mut named = self
                .selector
                .clone()
                .unwrap_or_default()
                .with_object_type(object_type)
                .with_id(raw.id.clone());
            if !raw.label.is_empty() {
                named = named.with_label(raw.label.clone());
            }

            let description = if raw.label.is_empty() {
                format!("{} {}", class, hex::encode(&raw.id))
            } else {
                format!("{} '{}'", class, String::from_utf8_lossy(&raw.label))
            };

            return Ok(Some(ObjectName {
                name: named.to_uri(),
                description,
            }));
        }
    }

    /// Ends any search and releases the session. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.end_search();
        self.eof = true;
        self.lock = None;
        if self.session.take().is_some() {
            trace!("PKCS#11: Search cursor closed");
        }
    }
}

impl Drop for SearchCursor {
    fn drop(&mut self) {
        self.close();
    }
}

//------------ Lookups -------------------------------------------------------

/// Returns the first object matching `selector`.
pub fn find_first(session: Arc<TokenSession>, selector: &Selector) -> Result<Option<TokenObject>, Error> {
    let mut cursor = SearchCursor::new(session, CursorMode::Objects);
    cursor.search_start(selector)?;
    let res = cursor.search_next_object();
    cursor.close();
    res
}

//------------ Tests ---------------------------------------------------------
