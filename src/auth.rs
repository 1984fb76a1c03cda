use russh::keys::{
    HashAlg, PrivateKey, PublicKey,
    ssh_key::{Certificate, certificate::CertType},
};
use tracing::debug;

use crate::error::GatewayError;

// Certificate extension that elevates a connection to admin, granting the
// right to initiate tunnels.
const PERMIT_PORT_FORWARDING: &str = "permit-port-forwarding";

// Permissions bag derived from an accepted client certificate.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Permissions {
    pub(crate) admin: bool,
}

// Checks certificates against the single trusted certificate authority.
pub(crate) struct CertificateAuthority {
    public_key: PublicKey,
}

impl CertificateAuthority {
    pub(crate) fn new(ca_public_key: &str) -> Result<Self, GatewayError> {
        let public_key =
            PublicKey::from_openssh(ca_public_key).map_err(GatewayError::InvalidAuthorityKey)?;
        debug!(fingerprint = %public_key.fingerprint(HashAlg::Sha256), "Loaded certificate authority.");
        Ok(CertificateAuthority { public_key })
    }

    // The authority is exactly the configured CA key, compared byte for byte.
    fn is_authority(&self, certificate: &Certificate) -> bool {
        certificate.signature_key() == self.public_key.key_data()
    }

    // Validate a client certificate for the given user. Returns the
    // permissions bag on success, None on any validation failure.
    pub(crate) fn authenticate(&self, user: &str, certificate: &Certificate) -> Option<Permissions> {
        if certificate.cert_type() != CertType::User {
            debug!(%user, key_id = %certificate.key_id(), "Rejecting non-user certificate.");
            return None;
        }
        if !self.is_authority(certificate) {
            debug!(%user, key_id = %certificate.key_id(), "Rejecting certificate from unknown authority.");
            return None;
        }
        let fingerprint = self.public_key.fingerprint(HashAlg::Sha256);
        if let Err(error) = certificate.validate([&fingerprint]) {
            debug!(%user, key_id = %certificate.key_id(), %error, "Certificate validation failed.");
            return None;
        }
        let principals = certificate.valid_principals();
        if !principals.is_empty() && !principals.iter().any(|principal| principal == user) {
            debug!(%user, key_id = %certificate.key_id(), "User not in certificate principals.");
            return None;
        }
        let admin = certificate
            .extensions()
            .iter()
            .any(|(name, _)| name == PERMIT_PORT_FORWARDING);
        Some(Permissions { admin })
    }

    // Validate the gateway's own host certificate at startup: it must be a
    // host certificate signed by this authority and match the host key.
    pub(crate) fn check_host_certificate(
        &self,
        certificate: &Certificate,
        host_key: &PrivateKey,
    ) -> Result<(), GatewayError> {
        if certificate.cert_type() != CertType::Host {
            return Err(GatewayError::NotAHostCertificate);
        }
        if !self.is_authority(certificate) {
            return Err(GatewayError::UntrustedHostCertificate);
        }
        let fingerprint = self.public_key.fingerprint(HashAlg::Sha256);
        certificate
            .validate([&fingerprint])
            .map_err(|_| GatewayError::UntrustedHostCertificate)?;
        if certificate.public_key() != host_key.public_key().key_data() {
            return Err(GatewayError::HostCertificateKeyMismatch);
        }
        Ok(())
    }
}
