//! The engine as a host crypto stack sees it.
//!
//! An [`Engine`] takes control commands, loads keys and certificates by
//! token URI, picks TLS client certificates and opens stores that list or
//! load everything a URI matches.
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, info, trace, warn};
use openssl::x509::{X509, X509NameRef};
use secrecy::SecretString;

use crate::commons::error::Error;
use crate::config::EngineConfig;
use crate::constants::{ENGINE_ID, ENGINE_NAME};
use crate::token::clientcert::{self, CertPurpose, ClientCredentials};
use crate::token::key::KeyClass;
use crate::token::pin;
use crate::token::search::{self, CursorMode, SearchCursor, TokenObject};
use crate::token::uri::ObjectType;
use crate::token::{ParseMode, Selector, SessionContext, TokenKey};

//------------ Control Commands ----------------------------------------------

/// Sets the module path for URIs that don't carry one.
pub const CMD_MODULE_PATH: &str = "MODULE_PATH";

/// Sets the PIN.
pub const CMD_PIN: &str = "PIN";

/// Loads a certificate by URI.
pub const CMD_LOAD_CERT_CTRL: &str = "LOAD_CERT_CTRL";

/// What a control command produced.
#[derive(Debug)]
pub enum CtrlOutput {
    Done,
    Certificate(X509),
}

//------------ Engine --------------------------------------------------------

pub struct Engine {
    context: Arc<SessionContext>,

    /// The selector of the last key load, used for picking client
    /// certificates from the same token.
    last_selector: Mutex<Option<Selector>>,
}

impl Engine {
    /// An engine loading native modules, prompting on the console.
    pub fn new() -> Self {
        Self::with_context(SessionContext::with_defaults())
    }

    pub fn with_context(context: SessionContext) -> Self {
        Engine {
            context: Arc::new(context),
            last_selector: Mutex::new(None),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, Error> {
        let engine = Self::new();
        engine.apply_config(config)?;
        Ok(engine)
    }

    /// Applies the module path, PIN and prompt settings of `config`.
    pub fn apply_config(&self, config: &EngineConfig) -> Result<(), Error> {
        if let Some(path) = &config.module_path {
            self.set_module_path(path.clone())?;
        }
        if let Some(pin) = &config.pin {
            self.set_pin(pin::duplicate(pin))?;
        }
        self.context.set_prompt_enabled(config.pin_prompt)
    }

    pub fn id(&self) -> &'static str {
        ENGINE_ID
    }

    pub fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// # Control
impl Engine {
    pub fn set_module_path(&self, path: PathBuf) -> Result<(), Error> {
        trace!("PKCS#11: Setting module path to {}", path.display());
        self.context.set_module_path(path)
    }

    pub fn set_pin(&self, pin: SecretString) -> Result<(), Error> {
        trace!("PKCS#11: Setting pin");
        self.context.set_pin(pin)
    }

    /// Runs a control command by name.
    pub fn ctrl(&self, cmd: &str, arg: &str) -> Result<CtrlOutput, Error> {
        match cmd {
            CMD_MODULE_PATH => {
                self.set_module_path(PathBuf::from(arg))?;
                Ok(CtrlOutput::Done)
            }
            CMD_PIN => {
                self.set_pin(SecretString::new(arg.to_string()))?;
                Ok(CtrlOutput::Done)
            }
            CMD_LOAD_CERT_CTRL => self.load_certificate(arg).map(CtrlOutput::Certificate),
            _ => Err(Error::UnknownCommand(cmd.to_string())),
        }
    }
}

/// # Loading
impl Engine {
    /// Loads the first certificate matching `uri`. No login is needed.
    pub fn load_certificate(&self, uri: &str) -> Result<X509, Error> {
        let selector = Selector::parse(uri, ParseMode::Enumerate)?.with_object_type(ObjectType::Cert);
        let session = self.context.acquire(&selector)?;

        match search::find_first(session, &selector)? {
            Some(TokenObject::Certificate { cert, .. }) => Ok(cert),
            _ => Err(Error::ObjectNotFound("certificate".to_string())),
        }
    }

    /// Loads the private key named by `uri`, logging in to the token.
    pub fn load_private_key(&self, uri: &str) -> Result<TokenKey, Error> {
        self.load_key(uri, KeyClass::Private)
    }

    /// Loads the public key named by `uri`.
    pub fn load_public_key(&self, uri: &str) -> Result<TokenKey, Error> {
        self.load_key(uri, KeyClass::Public)
    }

    fn load_key(&self, uri: &str, class: KeyClass) -> Result<TokenKey, Error> {
        let object_type = match class {
            KeyClass::Private => ObjectType::Private,
            KeyClass::Public => ObjectType::Public,
        };
        let selector = Selector::parse(uri, ParseMode::Object)?.with_object_type(object_type);
        self.remember(&selector);

        let session = self.context.acquire(&selector)?;
        let key = match search::find_first(session.clone(), &selector)? {
            Some(TokenObject::PrivateKey(key)) | Some(TokenObject::PublicKey(key)) => key,
            _ => {
                debug!("PKCS#11: No {} key matches {}", object_type, selector.to_uri());
                return Err(Error::ObjectNotFound(format!("{} key", object_type)));
            }
        };
        TokenKey::load(session, class, key)
    }

    fn remember(&self, selector: &Selector) {
        if let Ok(mut last) = self.last_selector.lock() {
            *last = Some(selector.clone());
        }
    }

    /// Picks a client certificate and its key for a TLS handshake.
    ///
    /// The token searched is the one the last key was loaded from, or the
    /// first one present if no key was loaded yet. `Ok(None)` means no
    /// certificate qualifies.
    pub fn load_ssl_client_cert(
        &self,
        ca_names: &[&X509NameRef],
        purpose: CertPurpose,
    ) -> Result<Option<ClientCredentials>, Error> {
        let selector = self
            .last_selector
            .lock()
            .map_err(|_| Error::token("engine lock is poisoned"))?
            .clone()
            .unwrap_or_else(|| Selector::new(ParseMode::Object));

        clientcert::select_client_cert(&self.context, &selector, ca_names, purpose)
    }
}

/// # Stores
impl Engine {
    /// Opens a store over everything `uri` matches.
    ///
    /// A URI naming neither an id nor a label lists names, otherwise the
    /// matching objects are loaded. The store has a session of its own.
    pub fn open_store(&self, uri: &str) -> Result<StoreCursor, Error> {
        let selector = Selector::parse(uri, ParseMode::Enumerate)?;
        let session = self.context.open_dedicated_session(&selector)?;

        let mode = if selector.has_object() {
            CursorMode::Objects
        } else {
            CursorMode::Names
        };
        let mut cursor = SearchCursor::new(session, mode);
        cursor.search_start(&selector)?;

        info!("PKCS#11: Opened store for {}", selector.to_uri());
        Ok(StoreCursor { cursor, failed: false })
    }
}

//------------ StoreItem -----------------------------------------------------

#[derive(Debug)]
pub enum StoreItem {
    Name { name: String, description: String },
    Certificate(X509),
    PublicKey(TokenKey),
    PrivateKey(TokenKey),
}

//------------ StoreCursor ---------------------------------------------------

/// A pull based cursor over a store.
pub struct StoreCursor {
    cursor: SearchCursor,
    failed: bool,
}

impl StoreCursor {
    /// Returns the next item, or `None` at the end.
    pub fn load(&mut self) -> Result<Option<StoreItem>, Error> {
        let res = self.load_next();
        if res.is_err() {
            self.failed = true;
        }
        res
    }

    fn load_next(&mut self) -> Result<Option<StoreItem>, Error> {
        if self.cursor.mode() == CursorMode::Names {
            return Ok(self.cursor.search_next_ids()?.map(|name| StoreItem::Name {
                name: name.name,
                description: name.description,
            }));
        }

        loop {
            let (class, key) = match self.cursor.search_next_object()? {
                None => return Ok(None),
                Some(TokenObject::Certificate { cert, .. }) => return Ok(Some(StoreItem::Certificate(cert))),
                Some(TokenObject::PublicKey(key)) => (KeyClass::Public, key),
                Some(TokenObject::PrivateKey(key)) => (KeyClass::Private, key),
            };

            // Keys we can't use are skipped like undecodable certificates.
            let label = String::from_utf8_lossy(&key.label).into_owned();
            match TokenKey::load(self.cursor.session()?.clone(), class, key) {
                Ok(key) if class == KeyClass::Public => return Ok(Some(StoreItem::PublicKey(key))),
                Ok(key) => return Ok(Some(StoreItem::PrivateKey(key))),
                Err(Error::UnsupportedKey(reason)) => {
                    warn!("PKCS#11: Skipping key '{}': {}", label, reason);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Whether the last load found nothing more.
    pub fn eof(&self) -> bool {
        self.cursor.eof()
    }

    /// Whether a load failed.
    pub fn error(&self) -> bool {
        self.failed
    }

    /// Ends the search and releases the session. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.cursor.close();
    }
}

impl Iterator for StoreCursor {
    type Item = Result<StoreItem, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        self.load().transpose()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::thread;

    use openssl::hash::MessageDigest;
    use openssl::sign::Verifier;

    use super::*;
    use crate::token::mock::{self, FnIdx, MockLoader, MockModule, MockObject, MockSlot, TestCa, Usage};
    use crate::token::module::SignMechanism;
    use crate::token::pin::NoPrompt;

    struct Fixture {
        key: openssl::pkey::PKey<openssl::pkey::Private>,
        cert: X509,
        module: Arc<MockModule>,
        engine: Engine,
    }

    fn fixture() -> Fixture {
        let ca = TestCa::new("CA");
        let key = mock::rsa_key();
        let cert = ca.issue("signer", &key, Usage::ClientAuth);

        let module = Arc::new(
            MockModule::new("libmock.so").with_slot(
                MockSlot::token(0, "Token A", "1234")
                    .with_object(MockObject::certificate(b"\x01", "signer", &cert))
                    .with_object(MockObject::public_key(b"\x01", "signer", &key))
                    .with_object(MockObject::private_key(b"\x01", "signer", &key))
                    .with_object(MockObject::data(b"\x02", "notes")),
            ),
        );
        let context = SessionContext::new(Arc::new(MockLoader::new(module.clone())), Box::new(NoPrompt));
        let engine = Engine::with_context(context);
        engine.ctrl(CMD_MODULE_PATH, "libmock.so").unwrap();

        Fixture {
            key,
            cert,
            module,
            engine,
        }
    }

    #[test]
    fn unknown_command_is_rejected() {
        let f = fixture();
        assert!(matches!(
            f.engine.ctrl("SO_PATH", "/usr/lib/engines"),
            Err(Error::UnknownCommand(cmd)) if cmd == "SO_PATH"
        ));
    }

    #[test]
    fn load_cert_ctrl_needs_no_pin() {
        let f = fixture();
        match f.engine.ctrl(CMD_LOAD_CERT_CTRL, "pkcs11:token=Token%20A;object=signer").unwrap() {
            CtrlOutput::Certificate(cert) => assert_eq!(cert.to_der().unwrap(), f.cert.to_der().unwrap()),
            other => panic!("unexpected output {:?}", other),
        }
        assert!(!f.engine.context().has_pin().unwrap());
    }

    #[test]
    fn private_key_signs_on_the_token() {
        let f = fixture();
        f.engine.ctrl(CMD_PIN, "1234").unwrap();

        let key = f.engine.load_private_key("pkcs11:token=Token%20A;id=%01").unwrap();
        assert_eq!(key.class(), KeyClass::Private);
        assert_eq!(key.label(), b"signer");

        let sig = key.sign(SignMechanism::Sha256RsaPkcs, b"some data").unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), &f.key).unwrap();
        verifier.update(b"some data").unwrap();
        assert!(verifier.verify(&sig).unwrap());
    }

    #[test]
    fn wrong_pin_fails_the_load() {
        let f = fixture();
        f.engine.ctrl(CMD_PIN, "0000").unwrap();
        assert!(matches!(
            f.engine.load_private_key("pkcs11:object=signer"),
            Err(Error::Login(_))
        ));
        assert_eq!(f.module.open_sessions(), 0);
    }

    #[test]
    fn public_key_is_materialized() {
        let f = fixture();
        f.engine.ctrl(CMD_PIN, "1234").unwrap();

        let key = f.engine.load_public_key("pkcs11:object=signer;type=cert").unwrap();
        assert_eq!(key.class(), KeyClass::Public);
        assert_eq!(
            key.public_key().unwrap().public_key_to_der().unwrap(),
            f.key.public_key_to_der().unwrap()
        );
        assert!(key.sign(SignMechanism::RsaPkcs, b"digest").is_err());
    }

    #[test]
    fn missing_key_is_reported() {
        let f = fixture();
        f.engine.ctrl(CMD_PIN, "1234").unwrap();
        assert!(matches!(
            f.engine.load_private_key("pkcs11:object=nothing"),
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[test]
    fn client_cert_comes_from_the_last_token() {
        let f = fixture();
        f.engine.ctrl(CMD_PIN, "1234").unwrap();
        f.engine.load_private_key("pkcs11:token=Token%20A;id=%01").unwrap();

        let creds = f
            .engine
            .load_ssl_client_cert(&[], CertPurpose::SslClient)
            .unwrap()
            .unwrap();
        assert_eq!(creds.certificate.to_der().unwrap(), f.cert.to_der().unwrap());
        assert_eq!(creds.key.id(), b"\x01");
    }

    #[test]
    fn store_lists_names_without_id_or_label() {
        let f = fixture();
        let store = f.engine.open_store("pkcs11:token=Token%20A").unwrap();

        let names: Vec<_> = store
            .map(|item| match item.unwrap() {
                StoreItem::Name { name, description } => (name, description),
                other => panic!("unexpected item {:?}", other),
            })
            .collect();

        // the private key is hidden without a login, the data object isn't listed
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|(name, _)| name.starts_with("pkcs11:token=Token%20A")));
        assert!(names[0].0.contains("type=cert"));
        assert!(names[1].0.contains("type=public"));
        assert_eq!(names[0].1, "certificate 'signer'");
        assert!(!f.engine.context().has_pin().unwrap());
    }

    #[test]
    fn store_loads_matching_objects() {
        let f = fixture();
        let mut store = f.engine.open_store("pkcs11:id=%01").unwrap();

        assert!(matches!(store.load().unwrap(), Some(StoreItem::Certificate(_))));
        assert!(!store.eof());
        assert!(matches!(store.load().unwrap(), Some(StoreItem::PublicKey(_))));
        assert!(!store.eof());
        // the private key stays hidden without a login
        assert!(store.load().unwrap().is_none());
        assert!(store.eof());
        assert!(!store.error());
    }

    #[test]
    fn store_close_releases_its_session() {
        let f = fixture();
        let mut store = f.engine.open_store("pkcs11:object=signer").unwrap();
        assert_eq!(f.module.open_sessions(), 1);
        assert_eq!(f.module.active_searches(), 1);

        store.close();
        store.close();
        assert_eq!(f.module.open_sessions(), 0);
        assert_eq!(f.module.active_searches(), 0);
        assert!(store.eof());
    }

    #[test]
    fn store_for_private_keys_logs_in() {
        let f = fixture();
        f.engine.ctrl(CMD_PIN, "1234").unwrap();

        let items: Vec<_> = f
            .engine
            .open_store("pkcs11:type=private;object=signer")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], StoreItem::PrivateKey(key) if key.id() == b"\x01"));
    }

    #[test]
    fn store_skips_keys_it_cannot_use() {
        let key = mock::rsa_key();
        let module = Arc::new(
            MockModule::new("libmock.so").with_slot(
                MockSlot::token(0, "Token A", "1234")
                    .with_object(MockObject::public_key(b"\x01", "k", &mock::ed25519_key()))
                    .with_object(MockObject::public_key(b"\x02", "k", &key)),
            ),
        );
        let context = SessionContext::new(Arc::new(MockLoader::new(module)), Box::new(NoPrompt));
        let engine = Engine::with_context(context);
        engine.ctrl(CMD_MODULE_PATH, "libmock.so").unwrap();

        let mut store = engine.open_store("pkcs11:object=k").unwrap();
        match store.load().unwrap() {
            Some(StoreItem::PublicKey(found)) => {
                assert_eq!(found.id(), b"\x02");
                assert_eq!(
                    found.public_key().unwrap().public_key_to_der().unwrap(),
                    key.public_key_to_der().unwrap()
                );
            }
            other => panic!("unexpected item {:?}", other),
        }
        assert!(store.load().unwrap().is_none());
        assert!(store.eof());
        assert!(!store.error());
    }

    #[test]
    fn concurrent_loads_share_one_engine() {
        let f = fixture();
        f.engine.ctrl(CMD_PIN, "1234").unwrap();
        let engine = Arc::new(f.engine);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        engine.load_private_key("pkcs11:id=%01").unwrap();
                        engine.load_certificate("pkcs11:object=signer").unwrap();
                        engine.load_ssl_client_cert(&[], CertPurpose::SslClient).unwrap().unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(f.module.counts().get(FnIdx::OpenSession), 1);
        assert_eq!(f.module.active_searches(), 0);
    }
}
