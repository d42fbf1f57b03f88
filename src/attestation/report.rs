//! The attestation report wire shape and its signature verification.

use p384::ecdsa::signature::Verifier;
use p384::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

/// A signed platform report as produced by the attestation device or the
/// cloud-provider metadata endpoint (spec.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// Firmware-computed measurement of the launched image.
    pub measurement: [u8; 48],
    pub platform_version: String,
    pub chip_id: String,
    pub nonce: [u8; 32],
    /// ECDSA/P-384 signature over `signed_bytes()`.
    pub signature: Vec<u8>,
}

impl Report {
    /// The exact byte sequence the signature covers: measurement,
    /// platform-version, chip-id and nonce concatenated, in that order.
    /// Both the device that produces the report and `verify()` below must
    /// agree on this framing.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(48 + self.platform_version.len() + self.chip_id.len() + 32);
        buf.extend_from_slice(&self.measurement);
        buf.extend_from_slice(self.platform_version.as_bytes());
        buf.extend_from_slice(self.chip_id.as_bytes());
        buf.extend_from_slice(&self.nonce);
        buf
    }
}

/// Result of a successful verification (spec.md §4.1): the fields an
/// auditor or the `HealthCheck` RPC is allowed to see. The raw report and
/// its signature are never forwarded past this point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedSummary {
    pub verified: bool,
    pub measurement: [u8; 48],
    pub chip_id: String,
    pub platform_version: String,
}

/// Verify `report`'s signature against `endorsement_key` using ECDSA/P-384
/// over SHA-384 of the report's signed bytes, per spec.md §4.1 ("verify the
/// signature with the platform-specified curve (SHA-384...)").
pub fn verify(report: &Report, endorsement_key: &VerifyingKey) -> VerifiedSummary {
    let message = report.signed_bytes();
    let verified = Signature::from_slice(&report.signature)
        .ok()
        .map(|sig| endorsement_key.verify(&message, &sig).is_ok())
        .unwrap_or(false);

    VerifiedSummary {
        verified,
        measurement: report.measurement,
        chip_id: report.chip_id.clone(),
        platform_version: report.platform_version.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p384::ecdsa::{signature::Signer, SigningKey};
    use rand::rngs::OsRng;

    fn make_signed_report(signing_key: &SigningKey) -> Report {
        let mut report = Report {
            measurement: [7u8; 48],
            platform_version: "v1".to_string(),
            chip_id: "chip-123".to_string(),
            nonce: [9u8; 32],
            signature: Vec::new(),
        };
        let message = report.signed_bytes();
        let sig: Signature = signing_key.sign(&message);
        report.signature = sig.to_vec();
        report
    }

    #[test]
    fn verifies_a_correctly_signed_report() {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let report = make_signed_report(&signing_key);

        let summary = verify(&report, &verifying_key);
        assert!(summary.verified);
        assert_eq!(summary.chip_id, "chip-123");
    }

    #[test]
    fn rejects_a_report_signed_by_a_different_key() {
        let signing_key = SigningKey::random(&mut OsRng);
        let other_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&other_key);
        let report = make_signed_report(&signing_key);

        let summary = verify(&report, &verifying_key);
        assert!(!summary.verified);
    }

    #[test]
    fn rejects_a_tampered_measurement() {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let mut report = make_signed_report(&signing_key);
        report.measurement[0] ^= 0xFF;

        let summary = verify(&report, &verifying_key);
        assert!(!summary.verified);
    }
}
