//! An in-memory token module for tests.
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey, PointConversionForm};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::Signer;
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage};
use openssl::x509::{X509, X509Builder, X509NameBuilder};
use secrecy::{ExposeSecret, SecretString};

use crate::commons::error::Error;
use crate::token::key::ec_params_for;
use crate::token::module::{
    KeyAttributes, KeyType, ModuleLoader, ObjectClass, ObjectHandle, RawObject, SearchFilter, SessionHandle,
    SignMechanism, SlotDescription, SlotId, TokenDescription, TokenModule,
};
use crate::token::uri::FixedField;

//------------ Call Counts ---------------------------------------------------

pub enum FnIdx {
    Initialize,
    Finalize,
    Slots,
    OpenSession,
    CloseSession,
    Login,
    FindObjectsInit,
    FindObjects,
    FindObjectsFinal,
    Sign,
    Decrypt,
    Count,
}

#[derive(Debug)]
pub struct MockCallCounts {
    call_counts: RwLock<Vec<u32>>,
}

impl MockCallCounts {
    pub fn new() -> Self {
        MockCallCounts {
            call_counts: RwLock::new(vec![0; FnIdx::Count as usize]),
        }
    }

    pub fn get(&self, fn_idx: FnIdx) -> u32 {
        self.call_counts.read().unwrap()[fn_idx as usize]
    }

    pub fn inc(&self, fn_idx: FnIdx) {
        self.call_counts.write().unwrap()[fn_idx as usize] += 1;
    }
}

//------------ MockObject ----------------------------------------------------

pub struct MockObject {
    pub class: ObjectClass,
    pub id: Vec<u8>,
    pub label: Vec<u8>,

    /// Only visible after login.
    pub private: bool,

    pub value: Option<Vec<u8>>,
    pub key: Option<PKey<Private>>,
}

impl MockObject {
    pub fn certificate(id: &[u8], label: &str, cert: &X509) -> Self {
        MockObject {
            class: ObjectClass::Certificate,
            id: id.to_vec(),
            label: label.as_bytes().to_vec(),
            private: false,
            value: Some(cert.to_der().unwrap()),
            key: None,
        }
    }

    /// A certificate object whose value isn't valid DER.
    pub fn broken_certificate(id: &[u8], label: &str) -> Self {
        MockObject {
            class: ObjectClass::Certificate,
            id: id.to_vec(),
            label: label.as_bytes().to_vec(),
            private: false,
            value: Some(b"not a certificate".to_vec()),
            key: None,
        }
    }

    pub fn public_key(id: &[u8], label: &str, key: &PKey<Private>) -> Self {
        MockObject {
            class: ObjectClass::PublicKey,
            id: id.to_vec(),
            label: label.as_bytes().to_vec(),
            private: false,
            value: None,
            key: Some(key.clone()),
        }
    }

    pub fn private_key(id: &[u8], label: &str, key: &PKey<Private>) -> Self {
        MockObject {
            class: ObjectClass::PrivateKey,
            id: id.to_vec(),
            label: label.as_bytes().to_vec(),
            private: true,
            value: None,
            key: Some(key.clone()),
        }
    }

    pub fn data(id: &[u8], label: &str) -> Self {
        MockObject {
            class: ObjectClass::Other,
            id: id.to_vec(),
            label: label.as_bytes().to_vec(),
            private: false,
            value: Some(b"opaque".to_vec()),
            key: None,
        }
    }

    fn matches(&self, filter: &SearchFilter) -> bool {
        filter.class.is_none_or(|class| class == self.class)
            && filter.id.as_ref().is_none_or(|id| id == &self.id)
            && filter.label.as_ref().is_none_or(|label| label == &self.label)
    }
}

//------------ MockSlot ------------------------------------------------------

pub struct MockSlot {
    id: SlotId,
    token: Option<TokenDescription>,
    pin: String,
    objects: Vec<MockObject>,
}

impl MockSlot {
    pub fn empty(id: SlotId) -> Self {
        MockSlot {
            id,
            token: None,
            pin: String::new(),
            objects: Vec::new(),
        }
    }

    pub fn token(id: SlotId, label: &str, pin: &str) -> Self {
        MockSlot {
            id,
            token: Some(TokenDescription {
                label: FixedField::pad(label.as_bytes()),
                manufacturer: FixedField::pad(b"NLnet Labs"),
                model: FixedField::pad(b"MockToken"),
                serial: FixedField::pad(format!("SN{:04}", id).as_bytes()),
            }),
            pin: pin.to_string(),
            objects: Vec::new(),
        }
    }

    pub fn with_object(mut self, object: MockObject) -> Self {
        self.objects.push(object);
        self
    }
}

//------------ MockModule ----------------------------------------------------

#[derive(Default)]
struct MockState {
    users: usize,
    next_session: u64,
    sessions: HashMap<u64, MockSession>,
    logged_in: HashSet<usize>,
    find_calls: usize,
}

struct MockSession {
    slot: usize,
    search: Option<VecDeque<usize>>,
}

pub struct MockModule {
    name: String,
    counts: Arc<MockCallCounts>,
    slots: Vec<MockSlot>,
    fail_open_session: bool,

    /// Makes the nth `find_objects` call (counting from 1) fail.
    fail_find_at: Option<usize>,

    state: Mutex<MockState>,
}

// test interface
impl MockModule {
    pub fn new(name: &str) -> Self {
        MockModule {
            name: name.to_string(),
            counts: Arc::new(MockCallCounts::new()),
            slots: Vec::new(),
            fail_open_session: false,
            fail_find_at: None,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_slot(mut self, slot: MockSlot) -> Self {
        self.slots.push(slot);
        self
    }

    pub fn failing_open_session(mut self) -> Self {
        self.fail_open_session = true;
        self
    }

    pub fn failing_find_at(mut self, call: usize) -> Self {
        self.fail_find_at = Some(call);
        self
    }

    pub fn counts(&self) -> &MockCallCounts {
        &self.counts
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn active_searches(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.sessions.values().filter(|s| s.search.is_some()).count()
    }

    pub fn users(&self) -> usize {
        self.state.lock().unwrap().users
    }

    fn object(&self, state: &MockState, session: SessionHandle, object: ObjectHandle) -> Result<&MockObject, Error> {
        let session = state
            .sessions
            .get(&session.0)
            .ok_or_else(|| Error::token("CKR_SESSION_HANDLE_INVALID"))?;
        self.slots[session.slot]
            .objects
            .get(object.0 as usize)
            .ok_or_else(|| Error::token("CKR_OBJECT_HANDLE_INVALID"))
    }

    fn private_key(&self, session: SessionHandle, key: ObjectHandle) -> Result<PKey<Private>, Error> {
        let state = self.state.lock().unwrap();
        let object = self.object(&state, session, key)?;
        match (&object.key, object.class) {
            (Some(key), ObjectClass::PrivateKey) => Ok(key.clone()),
            _ => Err(Error::token("CKR_KEY_FUNCTION_NOT_PERMITTED")),
        }
    }
}

impl TokenModule for MockModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> Result<(), Error> {
        self.counts.inc(FnIdx::Initialize);
        self.state.lock().unwrap().users += 1;
        Ok(())
    }

    fn finalize(&self) -> Result<(), Error> {
        self.counts.inc(FnIdx::Finalize);
        let mut state = self.state.lock().unwrap();
        assert!(state.users > 0, "finalize without initialize");
        state.users -= 1;
        if state.users == 0 {
            assert!(state.sessions.is_empty(), "finalize with open sessions");
        }
        Ok(())
    }

    fn slots(&self) -> Result<Vec<SlotDescription>, Error> {
        self.counts.inc(FnIdx::Slots);
        Ok(self
            .slots
            .iter()
            .map(|slot| SlotDescription {
                id: slot.id,
                token: slot.token.clone(),
            })
            .collect())
    }

    fn open_session(&self, slot: SlotId, _read_write: bool) -> Result<SessionHandle, Error> {
        self.counts.inc(FnIdx::OpenSession);
        if self.fail_open_session {
            return Err(Error::SessionOpen("CKR_SESSION_COUNT".to_string()));
        }

        let idx = self
            .slots
            .iter()
            .position(|s| s.id == slot && s.token.is_some())
            .ok_or(Error::NoMatchingSlot)?;

        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        let handle = state.next_session;
        state.sessions.insert(handle, MockSession { slot: idx, search: None });
        Ok(SessionHandle(handle))
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), Error> {
        self.counts.inc(FnIdx::CloseSession);
        let mut state = self.state.lock().unwrap();
        let closed = state
            .sessions
            .remove(&session.0)
            .ok_or_else(|| Error::token("CKR_SESSION_HANDLE_INVALID"))?;

        if !state.sessions.values().any(|s| s.slot == closed.slot) {
            state.logged_in.remove(&closed.slot);
        }
        Ok(())
    }

    fn login(&self, session: SessionHandle, pin: Option<&SecretString>) -> Result<(), Error> {
        self.counts.inc(FnIdx::Login);
        let mut state = self.state.lock().unwrap();
        let slot = state
            .sessions
            .get(&session.0)
            .ok_or_else(|| Error::token("CKR_SESSION_HANDLE_INVALID"))?
            .slot;

        if state.logged_in.contains(&slot) {
            // CKR_USER_ALREADY_LOGGED_IN
            return Ok(());
        }

        match pin {
            Some(pin) if pin.expose_secret() == &self.slots[slot].pin => {
                state.logged_in.insert(slot);
                Ok(())
            }
            _ => Err(Error::Login("CKR_PIN_INCORRECT".to_string())),
        }
    }

    fn find_objects_init(&self, session: SessionHandle, filter: &SearchFilter) -> Result<(), Error> {
        self.counts.inc(FnIdx::FindObjectsInit);
        let mut state = self.state.lock().unwrap();
        let logged_in = state.logged_in.clone();
        let session = state
            .sessions
            .get_mut(&session.0)
            .ok_or_else(|| Error::token("CKR_SESSION_HANDLE_INVALID"))?;

        if session.search.is_some() {
            return Err(Error::SearchStart("CKR_OPERATION_ACTIVE".to_string()));
        }

        let visible_private = logged_in.contains(&session.slot);
        let found = self.slots[session.slot]
            .objects
            .iter()
            .enumerate()
            .filter(|(_, object)| visible_private || !object.private)
            .filter(|(_, object)| object.matches(filter))
            .map(|(idx, _)| idx)
            .collect();
        session.search = Some(found);
        Ok(())
    }

    fn find_objects(&self, session: SessionHandle, max: usize) -> Result<Vec<ObjectHandle>, Error> {
        self.counts.inc(FnIdx::FindObjects);
        let mut state = self.state.lock().unwrap();
        state.find_calls += 1;
        if self.fail_find_at == Some(state.find_calls) {
            return Err(Error::token("CKR_DEVICE_REMOVED"));
        }

        let search = state
            .sessions
            .get_mut(&session.0)
            .and_then(|s| s.search.as_mut())
            .ok_or_else(|| Error::token("CKR_OPERATION_NOT_INITIALIZED"))?;

        let take = max.min(search.len());
        Ok(search.drain(..take).map(|idx| ObjectHandle(idx as u64)).collect())
    }

    fn find_objects_final(&self, session: SessionHandle) -> Result<(), Error> {
        self.counts.inc(FnIdx::FindObjectsFinal);
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&session.0)
            .ok_or_else(|| Error::token("CKR_SESSION_HANDLE_INVALID"))?;
        match session.search.take() {
            Some(_) => Ok(()),
            None => Err(Error::token("CKR_OPERATION_NOT_INITIALIZED")),
        }
    }

    fn object_attributes(&self, session: SessionHandle, object: ObjectHandle) -> Result<RawObject, Error> {
        let state = self.state.lock().unwrap();
        let object = self.object(&state, session, object)?;
        Ok(RawObject {
            class: Some(object.class),
            id: object.id.clone(),
            label: object.label.clone(),
            value: match object.class {
                ObjectClass::Certificate => object.value.clone(),
                _ => None,
            },
        })
    }

    fn key_attributes(&self, session: SessionHandle, object: ObjectHandle) -> Result<KeyAttributes, Error> {
        let state = self.state.lock().unwrap();
        let object = self.object(&state, session, object)?;
        let Some(key) = &object.key else {
            return Ok(KeyAttributes::default());
        };

        if let Ok(rsa) = key.rsa() {
            return Ok(KeyAttributes {
                key_type: Some(KeyType::Rsa),
                modulus: Some(rsa.n().to_vec()),
                public_exponent: Some(rsa.e().to_vec()),
                ..Default::default()
            });
        }

        let Ok(ec) = key.ec_key() else {
            return Ok(KeyAttributes {
                key_type: Some(KeyType::Other),
                ..Default::default()
            });
        };
        let nid = ec.group().curve_name().ok_or_else(|| Error::token("unnamed curve"))?;
        let ec_point = match object.class {
            ObjectClass::PublicKey => {
                let mut ctx = openssl::bn::BigNumContext::new().unwrap();
                let point = ec
                    .public_key()
                    .to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)
                    .unwrap();
                // DER OCTET STRING
                let mut der = vec![0x04];
                if point.len() > 127 {
                    der.push(0x81);
                }
                der.push(point.len() as u8);
                der.extend_from_slice(&point);
                Some(der)
            }
            _ => None,
        };

        Ok(KeyAttributes {
            key_type: Some(KeyType::Ec),
            ec_params: ec_params_for(nid).map(|params| params.to_vec()),
            ec_point,
            ..Default::default()
        })
    }

    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        mechanism: SignMechanism,
        data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        self.counts.inc(FnIdx::Sign);
        let key = self.private_key(session, key)?;

        let digest = match mechanism {
            SignMechanism::RsaPkcs => {
                let rsa = key.rsa().map_err(|_| Error::token("CKR_KEY_TYPE_INCONSISTENT"))?;
                let mut sig = vec![0; rsa.size() as usize];
                let len = rsa.private_encrypt(data, &mut sig, Padding::PKCS1)?;
                sig.truncate(len);
                return Ok(sig);
            }
            SignMechanism::Ecdsa => {
                let ec = key.ec_key().map_err(|_| Error::token("CKR_KEY_TYPE_INCONSISTENT"))?;
                let sig = EcdsaSig::sign(data, &ec)?;
                let width = (ec.group().degree() as usize).div_ceil(8);
                let mut raw = sig.r().to_vec_padded(width as i32)?;
                raw.extend(sig.s().to_vec_padded(width as i32)?);
                return Ok(raw);
            }
            SignMechanism::Sha256RsaPkcs => MessageDigest::sha256(),
            SignMechanism::Sha384RsaPkcs => MessageDigest::sha384(),
            SignMechanism::Sha512RsaPkcs => MessageDigest::sha512(),
        };

        let mut signer = Signer::new(digest, &key)?;
        Ok(signer.sign_oneshot_to_vec(data)?)
    }

    fn decrypt(&self, session: SessionHandle, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.counts.inc(FnIdx::Decrypt);
        let key = self.private_key(session, key)?;
        let rsa = key.rsa().map_err(|_| Error::token("CKR_KEY_TYPE_INCONSISTENT"))?;
        let mut plain = vec![0; rsa.size() as usize];
        let len = rsa
            .private_decrypt(data, &mut plain, Padding::PKCS1)
            .map_err(|_| Error::token("CKR_ENCRYPTED_DATA_INVALID"))?;
        plain.truncate(len);
        Ok(plain)
    }
}

//------------ MockLoader ----------------------------------------------------

pub struct MockLoader {
    module: Arc<MockModule>,
    loads: AtomicUsize,
}

impl MockLoader {
    pub fn new(module: Arc<MockModule>) -> Self {
        MockLoader {
            module,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModuleLoader for MockLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn TokenModule>, Error> {
        if path.file_name().is_some_and(|name| name == "missing.so") {
            return Err(Error::ModuleLoad(path.to_path_buf(), "cannot open shared object file".to_string()));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        let module: Arc<dyn TokenModule> = self.module.clone();
        Ok(module)
    }
}

//------------ Keys and Certificates -----------------------------------------

pub fn rsa_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

/// A key of a type the engine doesn't handle.
pub fn ed25519_key() -> PKey<Private> {
    PKey::generate_ed25519().unwrap()
}

pub fn ec_key(nid: Nid) -> PKey<Private> {
    let group = EcGroup::from_curve_name(nid).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Usage {
    ClientAuth,
    ServerAuth,
    Unrestricted,
}

pub struct TestCa {
    pub cert: X509,
    pub key: PKey<Private>,
}

impl TestCa {
    pub fn new(cn: &str) -> Self {
        let key = rsa_key();
        let mut builder = cert_builder(cn, &key, 1);
        builder.set_issuer_name(&builder_subject(cn)).unwrap();
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        TestCa {
            cert: builder.build(),
            key,
        }
    }

    pub fn issue(&self, cn: &str, key: &PKey<Private>, usage: Usage) -> X509 {
        let mut builder = cert_builder(cn, key, 2);
        builder.set_issuer_name(self.cert.subject_name()).unwrap();
        match usage {
            Usage::ClientAuth => builder
                .append_extension(ExtendedKeyUsage::new().client_auth().build().unwrap())
                .unwrap(),
            Usage::ServerAuth => builder
                .append_extension(ExtendedKeyUsage::new().server_auth().build().unwrap())
                .unwrap(),
            Usage::Unrestricted => {}
        }
        builder.sign(&self.key, MessageDigest::sha256()).unwrap();
        builder.build()
    }
}

fn builder_subject(cn: &str) -> openssl::x509::X509Name {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    name.build()
}

fn cert_builder(cn: &str, key: &PKey<Private>, serial: u32) -> X509Builder {
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(serial).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&builder_subject(cn)).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    builder
}
