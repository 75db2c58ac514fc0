use std::collections::BTreeSet;

use pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::{errors::SimulationError, ring::RingAddress};

/// Certificate subject for the node at `address`: its printable address with
/// every character outside `[A-Za-z0-9.-]` replaced by `0`.
pub fn subject_name(address: &RingAddress) -> String {
    address
        .to_string()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '0'
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBody {
    pub serial: u64,
    pub subject: String,
    pub issuer: String,
    /// Ring address the holder must present when linking. Absent on the
    /// authority's own certificate.
    pub node_address: Option<RingAddress>,
    /// SPKI DER encoded public key.
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    body: CertificateBody,
    signature: Vec<u8>,
}

fn digest<T: Serialize>(value: &T) -> Result<blake3::Hash, SimulationError> {
    Ok(blake3::hash(&bincode::serialize(value)?))
}

pub(crate) fn encode_public_key(key: &RsaPublicKey) -> Result<Vec<u8>, SimulationError> {
    key.to_public_key_der()
        .map(|der| der.as_bytes().to_vec())
        .map_err(|e| SimulationError::Crypto(e.to_string()))
}

impl Certificate {
    pub fn sign(body: CertificateBody, key: &RsaPrivateKey) -> Result<Self, SimulationError> {
        let hash = digest(&body)?;
        let signature = key.sign(Pkcs1v15Sign::new_unprefixed(), hash.as_bytes())?;
        Ok(Self { body, signature })
    }

    pub fn verify(&self, issuer: &RsaPublicKey) -> bool {
        digest(&self.body)
            .map(|hash| {
                issuer
                    .verify(Pkcs1v15Sign::new_unprefixed(), hash.as_bytes(), &self.signature)
                    .is_ok()
            })
            .unwrap_or(false)
    }

    pub fn body(&self) -> &CertificateBody {
        &self.body
    }

    pub fn subject(&self) -> &str {
        &self.body.subject
    }

    pub fn issuer(&self) -> &str {
        &self.body.issuer
    }

    pub fn node_address(&self) -> Option<RingAddress> {
        self.body.node_address
    }

    pub fn public_key(&self) -> Result<RsaPublicKey, SimulationError> {
        RsaPublicKey::from_public_key_der(&self.body.public_key)
            .map_err(|e| SimulationError::Crypto(e.to_string()))
    }
}

/// Authority-signed statement that a subject must no longer be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationNotice {
    subject: String,
    signature: Vec<u8>,
}

impl RevocationNotice {
    pub fn sign(subject: String, key: &RsaPrivateKey) -> Result<Self, SimulationError> {
        let hash = digest(&subject)?;
        let signature = key.sign(Pkcs1v15Sign::new_unprefixed(), hash.as_bytes())?;
        Ok(Self { subject, signature })
    }

    pub fn verify(&self, issuer: &RsaPublicKey) -> bool {
        digest(&self.subject)
            .map(|hash| {
                issuer
                    .verify(Pkcs1v15Sign::new_unprefixed(), hash.as_bytes(), &self.signature)
                    .is_ok()
            })
            .unwrap_or(false)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CertificateError {
    #[error("certificate issued by unknown authority `{0}`")]
    UnknownIssuer(String),
    #[error("certificate signature does not verify")]
    BadSignature,
    #[error("certificate is bound to {bound:?}, peer claims {claimed}")]
    AddressMismatch {
        bound: Option<RingAddress>,
        claimed: RingAddress,
    },
    #[error("subject `{0}` has been revoked")]
    Revoked(String),
}

/// Trust store of a single node: the authorities it accepts, its own
/// certificate and the subjects it has seen revoked.
#[derive(Debug, Clone)]
pub struct CertificateHandler {
    authorities: Vec<(Certificate, RsaPublicKey)>,
    local: Certificate,
    revoked: BTreeSet<String>,
}

impl CertificateHandler {
    pub fn new(authority: Certificate, local: Certificate) -> Result<Self, SimulationError> {
        let key = authority.public_key()?;
        Ok(Self {
            authorities: vec![(authority, key)],
            local,
            revoked: BTreeSet::new(),
        })
    }

    pub fn add_authority(&mut self, authority: Certificate) -> Result<(), SimulationError> {
        let key = authority.public_key()?;
        self.authorities.push((authority, key));
        Ok(())
    }

    pub fn local_certificate(&self) -> &Certificate {
        &self.local
    }

    fn issuer_key(&self, issuer: &str) -> Option<&RsaPublicKey> {
        self.authorities
            .iter()
            .find(|(cert, _)| cert.subject() == issuer)
            .map(|(_, key)| key)
    }

    /// Checks that `cert` chains to a known authority, is bound to `claimed`
    /// and has not been revoked.
    pub fn verify_remote(
        &self,
        cert: &Certificate,
        claimed: &RingAddress,
    ) -> Result<(), CertificateError> {
        let key = self
            .issuer_key(cert.issuer())
            .ok_or_else(|| CertificateError::UnknownIssuer(cert.issuer().to_owned()))?;
        if !cert.verify(key) {
            return Err(CertificateError::BadSignature);
        }
        if cert.node_address() != Some(*claimed) {
            return Err(CertificateError::AddressMismatch {
                bound: cert.node_address(),
                claimed: *claimed,
            });
        }
        if self.revoked.contains(cert.subject()) {
            return Err(CertificateError::Revoked(cert.subject().to_owned()));
        }
        Ok(())
    }

    /// Applies a revocation notice. Returns true the first time a valid notice
    /// for a subject is seen; the revoked set only ever grows.
    pub fn revoke(&mut self, notice: &RevocationNotice) -> bool {
        let valid = self
            .authorities
            .iter()
            .any(|(_, key)| notice.verify(key));
        if !valid {
            tracing::warn!(subject = notice.subject(), "Ignoring unverifiable revocation");
            return false;
        }
        self.revoked.insert(notice.subject().to_owned())
    }

    pub fn is_revoked(&self, subject: &str) -> bool {
        self.revoked.contains(subject)
    }

    pub fn revoked(&self) -> impl Iterator<Item = &str> {
        self.revoked.iter().map(String::as_str)
    }
}
