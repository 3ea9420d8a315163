//! Key exchange handshake using Elliptic Curve Diffie-Hellman (ECDH)
//!
//! Runs once per connection when encryption is enabled:
//!
//! ```text
//! server -> client  hail-request   [certificate]? [public value] [sig tag: u8, signature]?
//! client -> server  hail-response  [public value]
//! server -> client  greeting       [timestamp: i64p]
//! ```
//!
//! Bracketed `?` parts are present only when key exchange signing is enabled.
//! Both sides derive the symmetric key as `SHA-256(tag || x25519 shared secret)`.
//! A failure at any step is final for the connection.

use bytes::Bytes;
use rand_core::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{DigestSigner, DigestVerifier, SignatureEncoding, Signer, Verifier};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::config::SecurityConfig;
use crate::core::{BitReader, BitWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::SymmetricKey;

const KEY_DERIVATION_TAG: &[u8] = b"replica-protocol/session-key/v1";

/// Algorithm of the key exchange signature, as tagged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignatureAlgorithm {
    /// RSA PKCS#1 v1.5 over SHA-256
    Rsa = 0,
    /// DSA over SHA-256
    Dsa = 1,
}

impl SignatureAlgorithm {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(SignatureAlgorithm::Rsa),
            1 => Ok(SignatureAlgorithm::Dsa),
            _ => Err(ProtocolError::handshake(constants::ERR_INVALID_SIGNATURE_TYPE)),
        }
    }
}

/// Private key the server signs its public value with.
pub enum HandshakeSigner {
    Rsa(rsa::pkcs1v15::SigningKey<Sha256>),
    Dsa(dsa::SigningKey),
}

impl HandshakeSigner {
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            HandshakeSigner::Rsa(_) => SignatureAlgorithm::Rsa,
            HandshakeSigner::Dsa(_) => SignatureAlgorithm::Dsa,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match self {
            HandshakeSigner::Rsa(key) => key
                .try_sign(message)
                .map(|sig| sig.to_vec())
                .map_err(|e| ProtocolError::HandshakeFailed(format!("RSA signing failed: {e}"))),
            HandshakeSigner::Dsa(key) => {
                let signature: dsa::Signature = key
                    .try_sign_digest(Sha256::new_with_prefix(message))
                    .map_err(|e| {
                        ProtocolError::HandshakeFailed(format!("DSA signing failed: {e}"))
                    })?;
                Ok(signature.to_vec())
            }
        }
    }
}

/// Certificate and matching private key presented by a signing server.
pub struct ServerIdentity {
    certificate: Vec<u8>,
    signer: HandshakeSigner,
}

impl ServerIdentity {
    pub fn new(certificate: Vec<u8>, signer: HandshakeSigner) -> Self {
        Self {
            certificate,
            signer,
        }
    }

    pub fn rsa(certificate: Vec<u8>, key: rsa::RsaPrivateKey) -> Self {
        Self::new(
            certificate,
            HandshakeSigner::Rsa(rsa::pkcs1v15::SigningKey::<Sha256>::new(key)),
        )
    }

    pub fn dsa(certificate: Vec<u8>, key: dsa::SigningKey) -> Self {
        Self::new(certificate, HandshakeSigner::Dsa(key))
    }

    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.signer.algorithm()
    }
}

/// Ephemeral x25519 key pair for one connection. Consumed by [`derive`](Self::derive).
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Agree on the symmetric key with the peer's public value.
    pub fn derive(self, peer_public: &[u8]) -> Result<SymmetricKey> {
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| ProtocolError::handshake(constants::ERR_INVALID_PUBLIC_VALUE))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(ProtocolError::handshake(constants::ERR_NON_CONTRIBUTORY));
        }

        let mut hasher = Sha256::new();
        hasher.update(KEY_DERIVATION_TAG);
        hasher.update(shared.as_bytes());
        Ok(Zeroizing::new(hasher.finalize().into()))
    }
}

/// Validates the server certificate against the expected host.
pub trait CertificateVerifier: Send + Sync {
    /// Returns the certificate's DER-encoded SubjectPublicKeyInfo.
    fn verify(&self, certificate: &[u8], hostname: &str) -> Result<Vec<u8>>;
}

/// X.509 verification: validity window and SAN DNS / CN host match.
#[derive(Debug, Clone, Copy, Default)]
pub struct X509CertificateVerifier;

impl X509CertificateVerifier {
    pub fn new() -> Self {
        Self
    }
}

fn host_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let hostname = hostname.trim_end_matches('.');
    if let Some(suffix) = pattern.strip_prefix("*.") {
        match hostname.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        }
    } else {
        pattern.eq_ignore_ascii_case(hostname)
    }
}

impl CertificateVerifier for X509CertificateVerifier {
    fn verify(&self, certificate: &[u8], hostname: &str) -> Result<Vec<u8>> {
        let (_, cert) = X509Certificate::from_der(certificate).map_err(|e| {
            warn!(error = %e, "Unparseable server certificate");
            ProtocolError::handshake(constants::ERR_CERTIFICATE_INVALID)
        })?;

        if !cert.validity().is_valid() {
            warn!("Server certificate is outside its validity window");
            return Err(ProtocolError::handshake(constants::ERR_CERTIFICATE_INVALID));
        }

        let mut names: Vec<String> = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some((*dns).to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        if names.is_empty() {
            names = cert
                .subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok().map(str::to_string))
                .collect();
        }

        if !names.iter().any(|name| host_matches(name, hostname)) {
            warn!(hostname, ?names, "Server certificate does not cover the host");
            return Err(ProtocolError::handshake(constants::ERR_HOSTNAME_MISMATCH));
        }

        Ok(cert.public_key().raw.to_vec())
    }
}

/// Check `signature` over `public_value` with the key in `spki`.
pub fn verify_key_exchange_signature(
    spki: &[u8],
    algorithm: SignatureAlgorithm,
    public_value: &[u8],
    signature: &[u8],
) -> Result<()> {
    match algorithm {
        SignatureAlgorithm::Rsa => {
            let key = rsa::RsaPublicKey::from_public_key_der(spki)
                .map_err(|_| ProtocolError::handshake(constants::ERR_NO_RSA_KEY))?;
            let signature = rsa::pkcs1v15::Signature::try_from(signature)
                .map_err(|_| ProtocolError::handshake(constants::ERR_INVALID_SIGNATURE))?;
            rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key)
                .verify(public_value, &signature)
                .map_err(|_| ProtocolError::handshake(constants::ERR_INVALID_SIGNATURE))
        }
        SignatureAlgorithm::Dsa => {
            let key = dsa::VerifyingKey::from_public_key_der(spki)
                .map_err(|_| ProtocolError::handshake(constants::ERR_NO_DSA_KEY))?;
            let signature = dsa::Signature::try_from(signature)
                .map_err(|_| ProtocolError::handshake(constants::ERR_INVALID_SIGNATURE))?;
            key.verify_digest(Sha256::new_with_prefix(public_value), &signature)
                .map_err(|_| ProtocolError::handshake(constants::ERR_INVALID_SIGNATURE))
        }
    }
}

/// Build the hail-request. The returned key exchange must be kept until the
/// hail-response arrives.
#[instrument(skip(security, identity))]
pub fn server_build_hail(
    security: &SecurityConfig,
    identity: Option<&ServerIdentity>,
) -> Result<(KeyExchange, Bytes)> {
    let exchange = KeyExchange::generate();
    let public = exchange.public_key();
    let mut writer = BitWriter::with_capacity(64);

    if security.sign_key_exchange {
        let identity =
            identity.ok_or_else(|| ProtocolError::handshake(constants::ERR_MISSING_IDENTITY))?;
        writer.write_byte_array(identity.certificate());
        writer.write_byte_array(&public);
        writer.write_u8(identity.algorithm() as u8);
        writer.write_byte_array(&identity.signer.sign(&public)?);
    } else {
        writer.write_byte_array(&public);
    }

    debug!(signed = security.sign_key_exchange, "Built hail request");
    Ok((exchange, writer.into_bytes()))
}

/// Client result of a processed hail-request.
pub struct ClientHail {
    /// hail-response payload
    pub response: Bytes,
    /// `None` when encryption is disabled
    pub key: Option<SymmetricKey>,
}

/// Validate a hail-request and produce the hail-response.
#[instrument(skip(security, reader, verifier))]
pub fn client_process_hail(
    security: &SecurityConfig,
    reader: &mut BitReader<'_>,
    verifier: Option<&dyn CertificateVerifier>,
) -> Result<ClientHail> {
    if !security.enable_encryption {
        return Ok(ClientHail {
            response: Bytes::new(),
            key: None,
        });
    }

    let server_public = if security.sign_key_exchange {
        let certificate = reader.read_byte_array()?;
        let public = reader.read_byte_array()?;
        let algorithm = SignatureAlgorithm::from_tag(reader.read_u8()?)?;
        let signature = reader.read_byte_array()?;

        let verifier =
            verifier.ok_or_else(|| ProtocolError::handshake(constants::ERR_MISSING_VERIFIER))?;
        let spki = verifier.verify(certificate, &security.server_hostname)?;
        verify_key_exchange_signature(&spki, algorithm, public, signature)?;
        public
    } else {
        reader.read_byte_array()?
    };

    let exchange = KeyExchange::generate();
    let mut writer = BitWriter::with_capacity(40);
    writer.write_byte_array(&exchange.public_key());
    let key = exchange.derive(server_public)?;

    debug!("Processed hail request");
    Ok(ClientHail {
        response: writer.into_bytes(),
        key: Some(key),
    })
}

/// Complete the exchange with the client's hail-response.
#[instrument(skip(exchange, reader))]
pub fn server_process_hail_response(
    exchange: KeyExchange,
    reader: &mut BitReader<'_>,
) -> Result<SymmetricKey> {
    let client_public = reader.read_byte_array()?;
    exchange.derive(client_public)
}

fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Greeting payload sent once the server holds the key.
pub fn write_greeting(writer: &mut BitWriter) {
    writer.write_i64_packed(current_timestamp_ms());
}

pub fn read_greeting(reader: &mut BitReader<'_>) -> Result<i64> {
    reader.read_i64_packed()
}
