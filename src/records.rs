//! # Signed Peer Records
//!
//! Address records attached to PRUNE peer-exchange lists. A record binds a
//! peer's addresses to its identity with a domain-separated Ed25519
//! signature, so an evicted peer can only be steered towards addresses the
//! named peer actually published.
//!
//! The peer id doubles as the verification key: the 32 record bytes are the
//! Ed25519 public key, no separate identity layer.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::messages::{deserialize_bounded, PeerInfo};
use crate::peer::PeerId;

/// Domain separation prefix for peer record signatures.
/// SECURITY: Prevents cross-protocol signature replay attacks.
pub const RECORD_SIGNATURE_DOMAIN: &[u8] = b"meshsub-peer-record-v1:";

/// Error type for peer record validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    /// Record bytes did not decode.
    Malformed,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// The embedded peer id is not a valid Ed25519 point.
    InvalidPublicKey,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The embedded peer id differs from the envelope's peer id.
    PeerMismatch,
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => write!(f, "record bytes did not decode"),
            Self::InvalidLength => write!(f, "signature has invalid length"),
            Self::InvalidPublicKey => write!(f, "embedded peer id is not a valid public key"),
            Self::VerificationFailed => write!(f, "signature verification failed"),
            Self::PeerMismatch => write!(f, "record peer id does not match envelope"),
        }
    }
}

impl std::error::Error for RecordError {}

/// A self-certifying address record for one peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPeerRecord {
    /// The subject peer; also the Ed25519 verification key.
    pub peer: PeerId,
    /// Monotonic sequence number; consumers prefer the highest seen.
    pub seq: u64,
    /// Dialable addresses, transport-specific strings.
    pub addresses: Vec<String>,
    /// Ed25519 signature over the domain-prefixed payload.
    pub signature: Vec<u8>,
}

/// Canonical signed payload.
/// Format: peer(32) || seq(8) || addr_count(4) || [addr_len(4) || addr]*
fn build_signed_payload(peer: &PeerId, seq: u64, addresses: &[String]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + 8 + 4 + addresses.iter().map(|a| 4 + a.len()).sum::<usize>());
    payload.extend_from_slice(peer.as_bytes());
    payload.extend_from_slice(&seq.to_le_bytes());
    payload.extend_from_slice(&(addresses.len() as u32).to_le_bytes());
    for addr in addresses {
        payload.extend_from_slice(&(addr.len() as u32).to_le_bytes());
        payload.extend_from_slice(addr.as_bytes());
    }
    payload
}

impl SignedPeerRecord {
    /// Create and sign a record for the key's own identity.
    pub fn signed(key: &SigningKey, seq: u64, addresses: Vec<String>) -> Self {
        let peer = PeerId::from_bytes(key.verifying_key().to_bytes());
        let payload = build_signed_payload(&peer, seq, &addresses);
        let mut prefixed = Vec::with_capacity(RECORD_SIGNATURE_DOMAIN.len() + payload.len());
        prefixed.extend_from_slice(RECORD_SIGNATURE_DOMAIN);
        prefixed.extend_from_slice(&payload);
        let signature = key.sign(&prefixed).to_bytes().to_vec();
        Self {
            peer,
            seq,
            addresses,
            signature,
        }
    }

    /// Verify the signature against the embedded peer id.
    pub fn verify(&self) -> Result<(), RecordError> {
        let signature = Signature::from_slice(&self.signature).map_err(|_| RecordError::InvalidLength)?;
        let key = VerifyingKey::from_bytes(self.peer.as_bytes())
            .map_err(|_| RecordError::InvalidPublicKey)?;
        let payload = build_signed_payload(&self.peer, self.seq, &self.addresses);
        let mut prefixed = Vec::with_capacity(RECORD_SIGNATURE_DOMAIN.len() + payload.len());
        prefixed.extend_from_slice(RECORD_SIGNATURE_DOMAIN);
        prefixed.extend_from_slice(&payload);
        key.verify(&prefixed, &signature)
            .map_err(|_| RecordError::VerificationFailed)
    }

    /// Encode for embedding in a [`PeerInfo`].
    pub fn encode(&self) -> Vec<u8> {
        // A record is a few hundred bytes; serialization cannot hit the limit
        bincode::serialize(self).expect("peer record serialization is infallible")
    }

    /// Decode and validate a record carried by a PRUNE peer-exchange entry.
    ///
    /// Rejects records whose embedded peer differs from the envelope id as
    /// well as records that fail signature verification. Returns `Ok(None)`
    /// for the legitimate "no record available" case (empty bytes).
    pub fn from_peer_info(info: &PeerInfo) -> Result<Option<Self>, RecordError> {
        if info.signed_record.is_empty() {
            return Ok(None);
        }
        let record: Self =
            deserialize_bounded(&info.signed_record).map_err(|_| RecordError::Malformed)?;
        if record.peer != info.peer_id {
            return Err(RecordError::PeerMismatch);
        }
        record.verify()?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn sign_then_verify() {
        let key = keypair();
        let record = SignedPeerRecord::signed(&key, 1, vec!["198.51.100.7:9000".to_string()]);
        assert!(record.verify().is_ok());
    }

    #[test]
    fn tampered_address_rejected() {
        let key = keypair();
        let mut record = SignedPeerRecord::signed(&key, 1, vec!["198.51.100.7:9000".to_string()]);
        record.addresses[0] = "203.0.113.66:9000".to_string();
        assert_eq!(record.verify(), Err(RecordError::VerificationFailed));
    }

    #[test]
    fn encode_decode_preserves_peer_id() {
        let key = keypair();
        let record = SignedPeerRecord::signed(&key, 7, vec!["198.51.100.7:9000".to_string()]);
        let info = PeerInfo {
            peer_id: record.peer,
            signed_record: record.encode(),
        };
        let decoded = SignedPeerRecord::from_peer_info(&info).unwrap().unwrap();
        assert_eq!(decoded.peer, record.peer);
        assert_eq!(decoded, record);
    }

    #[test]
    fn envelope_peer_mismatch_rejected() {
        let key = keypair();
        let record = SignedPeerRecord::signed(&key, 1, vec!["198.51.100.7:9000".to_string()]);
        let info = PeerInfo {
            peer_id: PeerId::from_bytes([0x42; 32]),
            signed_record: record.encode(),
        };
        assert_eq!(
            SignedPeerRecord::from_peer_info(&info),
            Err(RecordError::PeerMismatch)
        );
    }

    #[test]
    fn empty_record_bytes_mean_no_record() {
        let info = PeerInfo::bare(PeerId::from_bytes([1; 32]));
        assert_eq!(SignedPeerRecord::from_peer_info(&info), Ok(None));
    }

    #[test]
    fn garbage_bytes_rejected() {
        let info = PeerInfo {
            peer_id: PeerId::from_bytes([1; 32]),
            signed_record: vec![0xFF; 16],
        };
        assert_eq!(
            SignedPeerRecord::from_peer_info(&info),
            Err(RecordError::Malformed)
        );
    }
}
