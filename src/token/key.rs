//! Keys that stay on the token.
//!
//! A [`TokenKey`] binds a key object to the session that found it. Private
//! key material is never extracted: signing and decryption are delegated to
//! the token through the session. Only the public half is materialized, as
//! an OpenSSL [`PKey`], when the token exposes it.
use std::fmt;
use std::sync::Arc;

use log::{debug, trace};
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::ecdsa::EcdsaSig;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Public};
use openssl::rsa::Rsa;

use crate::commons::error::Error;
use crate::token::module::{KeyAttributes, KeyType, ObjectHandle, SignMechanism};
use crate::token::search::KeyObject;
use crate::token::session::TokenSession;

//------------ Curves --------------------------------------------------------

/// Named curves with the DER encoding of their OID, as found in
/// `CKA_EC_PARAMS`.
const CURVES: &[(Nid, &[u8])] = &[
    (
        Nid::X9_62_PRIME256V1,
        &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07],
    ),
    (Nid::SECP384R1, &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22]),
    (Nid::SECP521R1, &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x23]),
];

fn curve_for(ec_params: &[u8]) -> Option<Nid> {
    CURVES
        .iter()
        .find(|(_, params)| *params == ec_params)
        .map(|(nid, _)| *nid)
}

/// Returns the `CKA_EC_PARAMS` value for a supported curve.
pub fn ec_params_for(nid: Nid) -> Option<&'static [u8]> {
    CURVES.iter().find(|(curve, _)| *curve == nid).map(|(_, params)| *params)
}

/// Strips the DER OCTET STRING some tokens wrap `CKA_EC_POINT` in.
fn unwrap_ec_point(point: &[u8]) -> &[u8] {
    if point.len() < 2 || point[0] != 0x04 {
        return point;
    }

    let (len, header) = match point[1] {
        len if len < 0x80 => (len as usize, 2),
        0x81 if point.len() > 2 => (point[2] as usize, 3),
        _ => return point,
    };

    if header + len == point.len() {
        &point[header..]
    } else {
        point
    }
}

//------------ DigestAlgorithm -----------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn digest_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// The DER DigestInfo header preceding the hash in PKCS#1 v1.5.
    fn digest_info_prefix(self) -> &'static [u8] {
        match self {
            DigestAlgorithm::Sha1 => &[
                0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
            ],
            DigestAlgorithm::Sha256 => &[
                0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00,
                0x04, 0x20,
            ],
            DigestAlgorithm::Sha384 => &[
                0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02, 0x05, 0x00,
                0x04, 0x30,
            ],
            DigestAlgorithm::Sha512 => &[
                0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05, 0x00,
                0x04, 0x40,
            ],
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlgorithm::Sha1 => write!(f, "sha1"),
            DigestAlgorithm::Sha256 => write!(f, "sha256"),
            DigestAlgorithm::Sha384 => write!(f, "sha384"),
            DigestAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

//------------ TokenKey ------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyClass {
    Public,
    Private,
}

pub struct TokenKey {
    session: Arc<TokenSession>,
    handle: ObjectHandle,
    class: KeyClass,
    key_type: KeyType,
    id: Vec<u8>,
    label: Vec<u8>,
    public_key: Option<PKey<Public>>,
}

impl TokenKey {
    /// Wraps a key object found through `session`.
    ///
    /// The public half is built from the key attributes if the token
    /// exposes them. Private EC keys usually don't carry the point, those
    /// end up without a public key.
    pub fn load(session: Arc<TokenSession>, class: KeyClass, object: KeyObject) -> Result<Self, Error> {
        let attributes = session.key_attributes(object.handle)?;
        let key_type = attributes.key_type.unwrap_or(KeyType::Other);

        let public_key = match key_type {
            KeyType::Rsa => rsa_public_key(&attributes)?,
            KeyType::Ec => ec_public_key(&attributes)?,
            KeyType::Other => {
                return Err(Error::UnsupportedKey(format!(
                    "key '{}' is neither RSA nor EC",
                    String::from_utf8_lossy(&object.label)
                )));
            }
        };

        if class == KeyClass::Public && public_key.is_none() {
            return Err(Error::UnsupportedKey(format!(
                "public key '{}' lacks its key material",
                String::from_utf8_lossy(&object.label)
            )));
        }

        debug!(
            "PKCS#11: Loaded {} {:?} key with id {}",
            key_type,
            class,
            hex::encode(&object.id)
        );

        Ok(TokenKey {
            session,
            handle: object.handle,
            class,
            key_type,
            id: object.id,
            label: object.label,
            public_key,
        })
    }

    pub fn class(&self) -> KeyClass {
        self.class
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn label(&self) -> &[u8] {
        &self.label
    }

    pub fn public_key(&self) -> Option<&PKey<Public>> {
        self.public_key.as_ref()
    }

    fn check_private(&self) -> Result<(), Error> {
        match self.class {
            KeyClass::Private => Ok(()),
            KeyClass::Public => Err(Error::UnsupportedKey(
                "private key operation requested on a public key".to_string(),
            )),
        }
    }

    /// Signs `data` on the token, returning the signature as produced there.
    pub fn sign(&self, mechanism: SignMechanism, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.check_private()?;

        let compatible = match mechanism {
            SignMechanism::Ecdsa => self.key_type == KeyType::Ec,
            _ => self.key_type == KeyType::Rsa,
        };
        if !compatible {
            return Err(Error::UnsupportedKey(format!(
                "{:?} cannot be used with a {} key",
                mechanism, self.key_type
            )));
        }

        trace!("PKCS#11: Signing {} bytes with {:?}", data.len(), mechanism);
        self.session.sign(self.handle, mechanism, data)
    }

    /// Signs a precomputed hash.
    ///
    /// RSA keys produce a PKCS#1 v1.5 signature over the DigestInfo. EC keys
    /// produce a DER encoded ECDSA signature.
    pub fn sign_digest(&self, algorithm: DigestAlgorithm, hash: &[u8]) -> Result<Vec<u8>, Error> {
        if hash.len() != algorithm.digest_len() {
            return Err(Error::token(format!(
                "{} digest must be {} bytes, got {}",
                algorithm,
                algorithm.digest_len(),
                hash.len()
            )));
        }

        match self.key_type {
            KeyType::Rsa => {
                let mut digest_info = algorithm.digest_info_prefix().to_vec();
                digest_info.extend_from_slice(hash);
                self.sign(SignMechanism::RsaPkcs, &digest_info)
            }
            KeyType::Ec => {
                let raw = self.sign(SignMechanism::Ecdsa, hash)?;
                if raw.is_empty() || raw.len() % 2 != 0 {
                    return Err(Error::token("malformed ECDSA signature"));
                }
                let (r, s) = raw.split_at(raw.len() / 2);
                let sig = EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
                Ok(sig.to_der()?)
            }
            KeyType::Other => Err(Error::UnsupportedKey("unknown key type".to_string())),
        }
    }

    /// Decrypts RSA PKCS#1 v1.5 ciphertext on the token.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.check_private()?;
        if self.key_type != KeyType::Rsa {
            return Err(Error::UnsupportedKey("only RSA keys can decrypt".to_string()));
        }
        self.session.decrypt(self.handle, data)
    }
}

impl fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenKey")
            .field("class", &self.class)
            .field("key_type", &self.key_type)
            .field("id", &hex::encode(&self.id))
            .field("label", &String::from_utf8_lossy(&self.label))
            .field("slot", &self.session.slot())
            .finish()
    }
}

fn rsa_public_key(attributes: &KeyAttributes) -> Result<Option<PKey<Public>>, Error> {
    let (Some(modulus), Some(exponent)) = (&attributes.modulus, &attributes.public_exponent) else {
        return Ok(None);
    };
    let rsa = Rsa::from_public_components(BigNum::from_slice(modulus)?, BigNum::from_slice(exponent)?)?;
    Ok(Some(PKey::from_rsa(rsa)?))
}

fn ec_public_key(attributes: &KeyAttributes) -> Result<Option<PKey<Public>>, Error> {
    let Some(params) = &attributes.ec_params else {
        return Ok(None);
    };
    let nid = curve_for(params).ok_or_else(|| Error::UnsupportedKey(format!("EC curve {}", hex::encode(params))))?;

    let Some(point) = &attributes.ec_point else {
        return Ok(None);
    };

    let group = EcGroup::from_curve_name(nid)?;
    let mut ctx = BigNumContext::new()?;
    let point = EcPoint::from_bytes(&group, unwrap_ec_point(point), &mut ctx)?;
    let key = EcKey::from_public_key(&group, &point)?;
    Ok(Some(PKey::from_ec_key(key)?))
}

//------------ Tests ---------------------------------------------------------
