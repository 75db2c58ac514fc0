//! Certificates, revocation and security associations.

mod certificate;
mod overlord;
mod trust;

pub use certificate::{
    subject_name, Certificate, CertificateBody, CertificateError, CertificateHandler,
    RevocationNotice,
};
pub use overlord::{Association, HandshakeStyle, SecurityOverlord};
pub use trust::{TrustManager, AUTHORITY_SUBJECT};
