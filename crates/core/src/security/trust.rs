use pkcs8::{EncodePublicKey, LineEnding};
use rand::{rngs::StdRng, SeedableRng};
use rsa::{RsaPrivateKey, RsaPublicKey};

use super::certificate::{
    encode_public_key, subject_name, Certificate, CertificateBody, CertificateHandler,
    RevocationNotice,
};
use crate::{errors::SimulationError, ring::RingAddress, simulation::SimulationRng};

pub const AUTHORITY_SUBJECT: &str = "ringsim-authority";

/// Single certificate authority for a simulation run.
///
/// Node certificates carry a copy of the authority public key rather than a
/// key of their own, so only one keypair is generated per run.
pub struct TrustManager {
    key: RsaPrivateKey,
    authority: Certificate,
    next_serial: u64,
    issued_revocations: Vec<String>,
}

impl TrustManager {
    /// Generates the authority key from a stream seeded off `rng`, so a run
    /// replays with the same key.
    pub fn new(bits: usize, rng: &SimulationRng) -> Result<Self, SimulationError> {
        let mut key_rng = StdRng::seed_from_u64(rng.gen_u64());
        let key = RsaPrivateKey::new(&mut key_rng, bits)?;
        let public = RsaPublicKey::from(&key);
        let authority = Certificate::sign(
            CertificateBody {
                serial: 0,
                subject: AUTHORITY_SUBJECT.to_owned(),
                issuer: AUTHORITY_SUBJECT.to_owned(),
                node_address: None,
                public_key: encode_public_key(&public)?,
            },
            &key,
        )?;
        tracing::debug!(bits, "Generated simulation authority key");
        Ok(Self {
            key,
            authority,
            next_serial: 1,
            issued_revocations: Vec::new(),
        })
    }

    pub fn authority_certificate(&self) -> &Certificate {
        &self.authority
    }

    pub fn authority_public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.key)
    }

    pub fn authority_public_key_pem(&self) -> Result<String, SimulationError> {
        self.authority_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SimulationError::Crypto(e.to_string()))
    }

    /// Issues a certificate binding `address` to its derived subject name.
    pub fn issue(&mut self, address: &RingAddress) -> Result<Certificate, SimulationError> {
        let serial = self.next_serial;
        self.next_serial += 1;
        Certificate::sign(
            CertificateBody {
                serial,
                subject: subject_name(address),
                issuer: AUTHORITY_SUBJECT.to_owned(),
                node_address: Some(*address),
                public_key: encode_public_key(&self.authority_public_key())?,
            },
            &self.key,
        )
    }

    /// Issues a certificate for `address` and a trust store that accepts this
    /// authority.
    pub fn handler_for(
        &mut self,
        address: &RingAddress,
    ) -> Result<CertificateHandler, SimulationError> {
        let local = self.issue(address)?;
        CertificateHandler::new(self.authority.clone(), local)
    }

    /// Signs a revocation for `subject`.
    pub fn revoke(&mut self, subject: &str) -> Result<RevocationNotice, SimulationError> {
        let notice = RevocationNotice::sign(subject.to_owned(), &self.key)?;
        self.issued_revocations.push(subject.to_owned());
        Ok(notice)
    }

    pub fn issued_revocations(&self) -> &[String] {
        &self.issued_revocations
    }
}

impl std::fmt::Debug for TrustManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustManager")
            .field("issued", &(self.next_serial - 1))
            .field("revocations", &self.issued_revocations.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::CertificateError;

    const TEST_BITS: usize = 1024;

    #[test]
    fn issued_certificates_verify_against_the_authority() -> testresult::TestResult {
        let mut trust = TrustManager::new(TEST_BITS, &SimulationRng::new(100))?;
        let rng = SimulationRng::new(1);
        let a = RingAddress::random(&rng);
        let b = RingAddress::random(&rng);

        let handler_a = trust.handler_for(&a)?;
        let cert_b = trust.issue(&b)?;
        assert_eq!(cert_b.subject(), subject_name(&b));
        assert!(handler_a.verify_remote(&cert_b, &b).is_ok());
        assert!(matches!(
            handler_a.verify_remote(&cert_b, &a),
            Err(CertificateError::AddressMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn foreign_authority_is_rejected() -> testresult::TestResult {
        let mut ours = TrustManager::new(TEST_BITS, &SimulationRng::new(100))?;
        let mut theirs = TrustManager::new(TEST_BITS, &SimulationRng::new(101))?;
        let rng = SimulationRng::new(2);
        let addr = RingAddress::random(&rng);

        let handler = ours.handler_for(&addr)?;
        let forged = theirs.issue(&addr)?;
        assert_eq!(
            handler.verify_remote(&forged, &addr),
            Err(CertificateError::BadSignature)
        );
        Ok(())
    }

    #[test]
    fn authority_key_follows_the_seed() -> testresult::TestResult {
        let first = TrustManager::new(TEST_BITS, &SimulationRng::new(9))?;
        let replay = TrustManager::new(TEST_BITS, &SimulationRng::new(9))?;
        let other = TrustManager::new(TEST_BITS, &SimulationRng::new(10))?;
        assert_eq!(first.authority_public_key(), replay.authority_public_key());
        assert_ne!(first.authority_public_key(), other.authority_public_key());
        Ok(())
    }

    #[test]
    fn revocation_is_append_only() -> testresult::TestResult {
        let mut trust = TrustManager::new(TEST_BITS, &SimulationRng::new(100))?;
        let rng = SimulationRng::new(3);
        let victim = RingAddress::random(&rng);
        let observer = RingAddress::random(&rng);
        let mut handler = trust.handler_for(&observer)?;
        let victim_cert = trust.issue(&victim)?;

        let notice = trust.revoke(&subject_name(&victim))?;
        assert!(handler.revoke(&notice));
        assert!(!handler.revoke(&notice));
        assert!(handler.is_revoked(victim_cert.subject()));
        assert!(matches!(
            handler.verify_remote(&victim_cert, &victim),
            Err(CertificateError::Revoked(_))
        ));
        assert_eq!(trust.issued_revocations().len(), 1);
        Ok(())
    }

    #[test]
    fn subject_names_only_use_safe_characters() {
        let rng = SimulationRng::new(4);
        let name = subject_name(&RingAddress::random(&rng));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-'));
        assert!(name.starts_with("ring0node0"));
    }
}
