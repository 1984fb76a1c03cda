#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("Server version must start with \"SSH-2.0-\"")]
    InvalidServerVersion,
    #[error("Invalid certificate authority public key")]
    InvalidAuthorityKey(#[source] russh::keys::ssh_key::Error),
    #[error("Invalid host certificate")]
    InvalidHostCertificate(#[source] russh::keys::ssh_key::Error),
    #[error("Certificate is not a host certificate")]
    NotAHostCertificate,
    #[error("Host certificate is not signed by the certificate authority")]
    UntrustedHostCertificate,
    #[error("Host certificate does not match the host private key")]
    HostCertificateKeyMismatch,
    #[error("Invalid host private key")]
    InvalidHostKey(#[source] russh::keys::Error),
    #[error("Service already registered")]
    ServiceAlreadyRegistered,
    #[error("Malformed payload")]
    MalformedPayload,
    #[error("Status record of {0} bytes exceeds the record size limit")]
    StatusRecordTooLarge(usize),
}
