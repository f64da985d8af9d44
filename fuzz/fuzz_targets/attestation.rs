//! Fuzz target for attestation payload validation
//!
//! Validation over arbitrary payloads and challenges must never panic,
//! and a genuine attestation for the same challenge must always pass.

#![no_main]

use libfuzzer_sys::fuzz_target;
use qlic_crypto::auth::{
    IdentityProvider, IdentityVerifier, PretrustedIdentity, PretrustedVerifier,
    ALG_PRETRUSTED_ED25519,
};

#[derive(arbitrary::Arbitrary, Debug)]
struct AttestationInput {
    challenge: Vec<u8>,
    payload: Vec<u8>,
}

fuzz_target!(|input: AttestationInput| {
    let AttestationInput { challenge, payload } = input;
    let identity = PretrustedIdentity::from_seed([0x5Au8; 32]);
    let verifier = PretrustedVerifier::new(identity.public_key()).expect("valid pinned key");

    let _ = verifier.validate_attestation(ALG_PRETRUSTED_ED25519, &challenge, &payload);

    if let Ok(genuine) = identity.generate_attestation(ALG_PRETRUSTED_ED25519, &challenge) {
        verifier
            .validate_attestation(ALG_PRETRUSTED_ED25519, &challenge, &genuine)
            .expect("genuine attestation validates");
    }
});
