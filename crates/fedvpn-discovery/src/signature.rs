//! Minisign verification for the discovery catalogs.
//!
//! Catalogs are signed with minisign's hashed variant: Ed25519 over the
//! Blake2b-512 digest of the file. The trusted comment must carry the
//! signing timestamp and the file name it covers; both are returned to the
//! cache layer for rollback enforcement.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use blake2::{Blake2b512, Digest};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use fedvpn_core::error::{CoreResult, Error};
use tracing::{debug, warn};

/// Algorithm tag of hashed minisign signatures.
const SIG_ALG_HASHED: &[u8; 2] = b"ED";
/// Algorithm tag of minisign public keys (and of legacy signatures).
const KEY_ALG: &[u8; 2] = b"Ed";

/// Metadata recovered from a valid signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMeta {
    /// Unix timestamp from the trusted comment.
    pub timestamp: u64,
    /// File name the trusted comment declares.
    pub file: String,
}

struct DecodedKey {
    key_id: [u8; 8],
    key: VerifyingKey,
}

fn decode_public_key(encoded: &str) -> CoreResult<DecodedKey> {
    let blob = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::signature_invalid(format!("public key is not base64: {e}")))?;
    if blob.len() != 42 {
        return Err(Error::signature_invalid(format!(
            "public key is {} bytes, expected 42",
            blob.len()
        )));
    }
    if &blob[0..2] != KEY_ALG {
        return Err(Error::signature_invalid("public key algorithm is not Ed"));
    }
    let mut key_id = [0u8; 8];
    key_id.copy_from_slice(&blob[2..10]);
    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&blob[10..42]);
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| Error::signature_invalid(format!("public key rejected: {e}")))?;
    Ok(DecodedKey { key_id, key })
}

/// Verify a `.minisig` document over `content`.
///
/// Returns the signed timestamp and declared file name on success. The
/// declared file name must equal `expected_file`.
pub fn verify(
    signature_text: &str,
    content: &[u8],
    expected_file: &str,
    trusted_keys: &[&str],
) -> CoreResult<SignedMeta> {
    let lines: Vec<&str> = signature_text.lines().collect();
    if lines.len() < 4 {
        return Err(Error::signature_invalid("signature file is truncated"));
    }

    let sig_blob = STANDARD
        .decode(lines[1].trim())
        .map_err(|e| Error::signature_invalid(format!("signature is not base64: {e}")))?;
    if sig_blob.len() != 74 {
        return Err(Error::signature_invalid(format!(
            "signature blob is {} bytes, expected 74",
            sig_blob.len()
        )));
    }
    if &sig_blob[0..2] != SIG_ALG_HASHED {
        return Err(Error::signature_invalid(
            "signature does not use the hashed (Blake2b) minisign variant",
        ));
    }
    let key_id = &sig_blob[2..10];
    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(&sig_blob[10..74]);
    let signature = Signature::from_bytes(&sig_bytes);

    let decoded: Vec<DecodedKey> = trusted_keys
        .iter()
        .filter_map(|k| match decode_public_key(k) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("skipping malformed trusted key: {e}");
                None
            }
        })
        .collect();
    let Some(key) = decoded.iter().find(|k| k.key_id == key_id) else {
        return Err(Error::signature_invalid(format!(
            "signature key id {} matches no trusted key",
            hex::encode(key_id)
        )));
    };

    let trusted_comment = lines[2]
        .strip_prefix("trusted comment: ")
        .ok_or_else(|| Error::signature_invalid("missing trusted comment"))?;

    let global_blob = STANDARD
        .decode(lines[3].trim())
        .map_err(|e| Error::signature_invalid(format!("global signature is not base64: {e}")))?;
    let global_bytes: [u8; 64] = global_blob
        .try_into()
        .map_err(|_| Error::signature_invalid("global signature is not 64 bytes"))?;
    let global_signature = Signature::from_bytes(&global_bytes);

    // The global signature covers the raw signature followed by the
    // trusted comment, binding the comment to this signature.
    let mut global_message = Vec::with_capacity(64 + trusted_comment.len());
    global_message.extend_from_slice(&sig_bytes);
    global_message.extend_from_slice(trusted_comment.as_bytes());
    key.key
        .verify(&global_message, &global_signature)
        .map_err(|e| Error::signature_invalid(format!("trusted comment rejected: {e}")))?;

    let digest = Blake2b512::digest(content);
    key.key
        .verify(&digest, &signature)
        .map_err(|e| Error::signature_invalid(format!("content rejected: {e}")))?;

    let meta = parse_trusted_comment(trusted_comment)?;
    if meta.file != expected_file {
        return Err(Error::signature_invalid(format!(
            "signature covers '{}', expected '{}'",
            meta.file, expected_file
        )));
    }

    debug!(file = %meta.file, timestamp = meta.timestamp, "signature verified");
    Ok(meta)
}

/// Parse `timestamp:<unix>\tfile:<name>[\t…]`.
fn parse_trusted_comment(comment: &str) -> CoreResult<SignedMeta> {
    let mut fields = comment.split('\t');

    let timestamp = fields
        .next()
        .and_then(|f| f.strip_prefix("timestamp:"))
        .ok_or_else(|| Error::signature_invalid("trusted comment lacks a timestamp field"))?
        .parse::<u64>()
        .map_err(|e| Error::signature_invalid(format!("bad timestamp in trusted comment: {e}")))?;

    let file = fields
        .next()
        .and_then(|f| f.strip_prefix("file:"))
        .ok_or_else(|| Error::signature_invalid("trusted comment lacks a file field"))?
        .to_string();

    Ok(SignedMeta { timestamp, file })
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Signature fixtures shared by the cache and manager tests.

    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    pub const TEST_SEED: [u8; 32] = [7u8; 32];
    pub const TEST_KEY_ID: [u8; 8] = *b"testkey1";

    pub fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&TEST_SEED)
    }

    /// Base64 public key in minisign layout for the test signing key.
    pub fn public_key() -> String {
        let mut blob = Vec::with_capacity(42);
        blob.extend_from_slice(b"Ed");
        blob.extend_from_slice(&TEST_KEY_ID);
        blob.extend_from_slice(signing_key().verifying_key().as_bytes());
        STANDARD.encode(blob)
    }

    /// Produce a `.minisig` document over `content` in the hashed variant.
    pub fn sign(content: &[u8], timestamp: u64, file: &str) -> String {
        sign_with_comment(content, &format!("timestamp:{timestamp}\tfile:{file}\thashed"))
    }

    pub fn sign_with_comment(content: &[u8], trusted_comment: &str) -> String {
        let key = signing_key();
        let digest = Blake2b512::digest(content);
        let signature = key.sign(&digest);

        let mut sig_blob = Vec::with_capacity(74);
        sig_blob.extend_from_slice(b"ED");
        sig_blob.extend_from_slice(&TEST_KEY_ID);
        sig_blob.extend_from_slice(&signature.to_bytes());

        let mut global_message = Vec::new();
        global_message.extend_from_slice(&signature.to_bytes());
        global_message.extend_from_slice(trusted_comment.as_bytes());
        let global = key.sign(&global_message);

        format!(
            "untrusted comment: signed by test key\n{}\ntrusted comment: {}\n{}\n",
            STANDARD.encode(&sig_blob),
            trusted_comment,
            STANDARD.encode(global.to_bytes()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use fedvpn_core::error::ErrorKind;

    const CONTENT: &[u8] = br#"{"v": 5, "server_list": []}"#;

    #[test]
    fn valid_signature_verifies() {
        let sig = sign(CONTENT, 1000, "server_list.json");
        let key = public_key();
        let meta = verify(&sig, CONTENT, "server_list.json", &[key.as_str()]).unwrap();
        assert_eq!(meta.timestamp, 1000);
        assert_eq!(meta.file, "server_list.json");
    }

    #[test]
    fn tampered_content_is_rejected() {
        let sig = sign(CONTENT, 1000, "server_list.json");
        let key = public_key();
        let err = verify(&sig, b"{\"v\": 6}", "server_list.json", &[key.as_str()]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SignatureInvalid);
    }

    #[test]
    fn tampered_trusted_comment_is_rejected() {
        let sig = sign(CONTENT, 1000, "server_list.json");
        let forged = sig.replace("timestamp:1000", "timestamp:9999");
        let key = public_key();
        let err = verify(&forged, CONTENT, "server_list.json", &[key.as_str()]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SignatureInvalid);
    }

    #[test]
    fn wrong_declared_file_is_rejected() {
        let sig = sign(CONTENT, 1000, "organization_list.json");
        let key = public_key();
        let err = verify(&sig, CONTENT, "server_list.json", &[key.as_str()]).unwrap_err();
        assert!(err.message.contains("organization_list.json"));
    }

    #[test]
    fn legacy_unhashed_algorithm_is_rejected() {
        let sig = sign(CONTENT, 1000, "server_list.json");
        // Patch the algorithm tag inside the base64 signature blob.
        let mut lines: Vec<String> = sig.lines().map(str::to_string).collect();
        let mut blob = STANDARD.decode(&lines[1]).unwrap();
        blob[0..2].copy_from_slice(b"Ed");
        lines[1] = STANDARD.encode(&blob);
        let patched = lines.join("\n");

        let key = public_key();
        let err = verify(&patched, CONTENT, "server_list.json", &[key.as_str()]).unwrap_err();
        assert!(err.message.contains("hashed"));
    }

    #[test]
    fn unknown_key_id_is_rejected() {
        let sig = sign(CONTENT, 1000, "server_list.json");
        // A trusted key with a different key id.
        let mut blob = STANDARD.decode(public_key()).unwrap();
        blob[2..10].copy_from_slice(b"otherkey");
        let other = STANDARD.encode(&blob);

        let err = verify(&sig, CONTENT, "server_list.json", &[other.as_str()]).unwrap_err();
        assert!(err.message.contains("no trusted key"));
    }

    #[test]
    fn truncated_signature_file_is_rejected() {
        let err = verify("untrusted comment: x\nAAAA\n", CONTENT, "f", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SignatureInvalid);
    }

    #[test]
    fn comment_without_file_field_is_rejected() {
        let sig = sign_with_comment(CONTENT, "timestamp:1000");
        let key = public_key();
        let err = verify(&sig, CONTENT, "server_list.json", &[key.as_str()]).unwrap_err();
        assert!(err.message.contains("file field"));
    }

    #[test]
    fn production_keys_decode() {
        for key in crate::keys::TRUSTED_KEYS {
            decode_public_key(key).unwrap();
        }
    }
}
