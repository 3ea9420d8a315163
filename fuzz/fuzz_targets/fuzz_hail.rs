#![no_main]

use libfuzzer_sys::fuzz_target;
use replica_protocol::config::SecurityConfig;
use replica_protocol::core::BitReader;
use replica_protocol::protocol::handshake::{
    client_process_hail, server_process_hail_response, CertificateVerifier, KeyExchange,
    X509CertificateVerifier,
};

fuzz_target!(|data: &[u8]| {
    let unsigned = SecurityConfig {
        enable_encryption: true,
        sign_key_exchange: false,
        server_hostname: "localhost".to_string(),
    };
    let signed = SecurityConfig {
        sign_key_exchange: true,
        ..unsigned.clone()
    };
    let verifier = X509CertificateVerifier::new();

    let _ = client_process_hail(&unsigned, &mut BitReader::new(data), None);
    let _ = client_process_hail(&signed, &mut BitReader::new(data), Some(&verifier as &dyn CertificateVerifier));
    let _ = server_process_hail_response(KeyExchange::generate(), &mut BitReader::new(data));
});
