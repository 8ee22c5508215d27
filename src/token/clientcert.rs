//! Picking a TLS client certificate from the token.
use std::cmp::Ordering;
use std::fmt;

use log::{debug, info, trace, warn};
use openssl::x509::{X509, X509NameRef, X509Ref};
use x509_parser::extensions::ParsedExtension;
use x509_parser::parse_x509_certificate;

use crate::commons::error::Error;
use crate::token::context::SessionContext;
use crate::token::key::{KeyClass, TokenKey};
use crate::token::search::{CursorMode, SearchCursor, TokenObject};
use crate::token::uri::{ObjectType, ParseMode, Selector};

//------------ CertPurpose ---------------------------------------------------

/// What a certificate must be usable for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CertPurpose {
    #[default]
    SslClient,
    SslServer,
    Any,
}

impl fmt::Display for CertPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertPurpose::SslClient => write!(f, "TLS client"),
            CertPurpose::SslServer => write!(f, "TLS server"),
            CertPurpose::Any => write!(f, "any"),
        }
    }
}

/// Checks a leaf certificate against a purpose.
///
/// Follows OpenSSL's purpose rules: an extended key usage extension, if
/// present, must list the purpose, and a key usage extension, if present,
/// must allow a key operation TLS needs.
pub fn check_purpose(cert: &X509Ref, purpose: CertPurpose) -> Result<bool, Error> {
    if purpose == CertPurpose::Any {
        return Ok(true);
    }

    let der = cert.to_der()?;
    let (_, parsed) = parse_x509_certificate(&der).map_err(Error::decode)?;

    for ext in parsed.tbs_certificate.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::ExtendedKeyUsage(eku) => {
                let listed = match purpose {
                    CertPurpose::SslClient => eku.client_auth,
                    CertPurpose::SslServer => eku.server_auth,
                    CertPurpose::Any => true,
                };
                if !listed {
                    return Ok(false);
                }
            }
            ParsedExtension::KeyUsage(ku) => {
                let allowed = match purpose {
                    CertPurpose::SslClient => ku.digital_signature() || ku.key_agreement(),
                    CertPurpose::SslServer => {
                        ku.digital_signature() || ku.key_encipherment() || ku.key_agreement()
                    }
                    CertPurpose::Any => true,
                };
                if !allowed {
                    return Ok(false);
                }
            }
            _ => {}
        }
    }
    Ok(true)
}

/// Whether `cert` was issued by one of `ca_names`. No names accept any
/// issuer.
pub fn issuer_matches(ca_names: &[&X509NameRef], cert: &X509Ref) -> bool {
    ca_names.is_empty()
        || ca_names
            .iter()
            .any(|name| matches!(name.try_cmp(cert.issuer_name()), Ok(Ordering::Equal)))
}

//------------ Selection -----------------------------------------------------

/// A certificate with the token key belonging to it.
#[derive(Debug)]
pub struct ClientCredentials {
    pub certificate: X509,
    pub key: TokenKey,
}

/// Finds the first certificate on the token issued by one of `ca_names`
/// and usable for `purpose`, together with the private key sharing its id.
///
/// Returns `Ok(None)` if no certificate qualifies. A token error during the
/// search is returned as an error, it doesn't end the search as if there
/// were no more candidates.
pub fn select_client_cert(
    context: &SessionContext,
    selector: &Selector,
    ca_names: &[&X509NameRef],
    purpose: CertPurpose,
) -> Result<Option<ClientCredentials>, Error> {
    // Object mode, as finding the key needs a login. The PIN is resolved
    // before anything is searched.
    let selector = selector.slot_selector(ParseMode::Object);
    let session = context.acquire(&selector)?;

    let mut cursor = SearchCursor::new(session.clone(), CursorMode::Objects);
    cursor.search_start(&selector.clone().with_object_type(ObjectType::Cert))?;

    let (id, label, certificate) = loop {
        let Some(object) = cursor.search_next_object()? else {
            debug!("PKCS#11: No certificate on the token is usable for {}", purpose);
            return Ok(None);
        };
        let TokenObject::Certificate { id, label, cert } = object else {
            continue;
        };

        if !issuer_matches(ca_names, &cert) {
            trace!("PKCS#11: Certificate '{}' has no accepted issuer", String::from_utf8_lossy(&label));
            continue;
        }
        match check_purpose(&cert, purpose) {
            Ok(true) => break (id, label, cert),
            Ok(false) => {
                trace!(
                    "PKCS#11: Certificate '{}' is not usable for {}",
                    String::from_utf8_lossy(&label),
                    purpose
                );
            }
            Err(err) => {
                warn!("PKCS#11: Skipping certificate '{}': {}", String::from_utf8_lossy(&label), err);
            }
        }
    };

    info!("PKCS#11: Selected client certificate '{}'", String::from_utf8_lossy(&label));

    // The key search runs on the same cursor, no other search on the
    // session gets in between.
    let key_selector = selector.with_object_type(ObjectType::Private).with_id(id);
    cursor.search_start(&key_selector)?;
    let key = cursor.search_next_object();
    cursor.close();
    let key = match key? {
        Some(TokenObject::PrivateKey(key)) => key,
        _ => return Err(Error::ObjectNotFound("private key for the client certificate".to_string())),
    };

    let key = TokenKey::load(session, KeyClass::Private, key)?;
    Ok(Some(ClientCredentials { certificate, key }))
}

//------------ Tests ---------------------------------------------------------
