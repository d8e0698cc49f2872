//! secp256k1 wallets: key management, address derivation and signing.

use crate::crypto::{keccak256, sha256};
use crate::error::{ValidationError, WalletError};
use crate::transaction::{Transaction, TransactionKind};
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Sender of system-issued transactions.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

const ADDRESS_HEX_LEN: usize = 40;

/// `0x` followed by 40 lowercase hex digits, the form balances are keyed by.
pub fn is_valid_address(address: &str) -> bool {
    match address.strip_prefix("0x") {
        Some(body) => {
            body.len() == ADDRESS_HEX_LEN
                && body.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}

/// Canonical spelling of a user-supplied address: trimmed and lowercased.
/// The result still has to pass [`is_valid_address`].
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Last 20 bytes of Keccak-256 over the uncompressed key (without the 0x04 tag).
pub fn address_from_verifying_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

#[derive(Serialize, Deserialize)]
struct WalletFile {
    private_key: String,
    public_key: String,
    address: String,
}

#[derive(Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    public_key: String,
    address: String,
    path: Option<PathBuf>,
}

impl Wallet {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Generates a wallet and persists it to `path`.
    pub fn generate_at(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let mut wallet = Self::generate();
        wallet.path = Some(path.as_ref().to_path_buf());
        wallet.save(path)?;
        Ok(wallet)
    }

    /// Imports a hex-encoded 32-byte scalar.
    pub fn import(private_key: &str) -> Result<Self, WalletError> {
        let hex_input = private_key.trim().trim_start_matches("0x");
        if hex_input.len() != 64 {
            return Err(WalletError::InvalidKey(
                "private key must be 32 bytes (64 hex chars)".into(),
            ));
        }
        let bytes =
            hex::decode(hex_input).map_err(|e| WalletError::InvalidKey(e.to_string()))?;
        let signing_key =
            SigningKey::from_slice(&bytes).map_err(|e| WalletError::InvalidKey(e.to_string()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let data = fs::read(path.as_ref())?;
        let file: WalletFile = serde_json::from_slice(&data)?;
        let mut wallet = Self::import(&file.private_key)?;
        if wallet.address != file.address {
            return Err(WalletError::InvalidKey(format!(
                "stored address {} does not match key",
                file.address
            )));
        }
        wallet.path = Some(path.as_ref().to_path_buf());
        Ok(wallet)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), WalletError> {
        let file = WalletFile {
            private_key: self.export_private_key(),
            public_key: self.public_key.clone(),
            address: self.address.clone(),
        };
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_vec_pretty(&file)?;
        let tmp_path = path.as_ref().with_extension("json.tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, path.as_ref())?;
        Ok(())
    }

    /// Replaces the key pair. The new triple is persisted before it becomes active.
    pub fn regenerate(&mut self) -> Result<(), WalletError> {
        let mut next = Self::generate();
        if let Some(path) = &self.path {
            next.save(path)?;
            next.path = Some(path.clone());
        }
        *self = next;
        Ok(())
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let public_key = hex::encode(verifying_key.to_encoded_point(true).as_bytes());
        let address = address_from_verifying_key(verifying_key);
        Wallet {
            signing_key,
            public_key,
            address,
            path: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Compressed SEC1 public key, hex-encoded.
    pub fn public_key(&self) -> String {
        self.public_key.clone()
    }

    pub fn export_private_key(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// ECDSA over SHA-256 of `message`, hex-encoded compact signature.
    pub fn sign_message(&self, message: &[u8]) -> String {
        let signature: Signature = self.signing_key.sign(message);
        hex::encode(signature.to_bytes())
    }

    pub fn verify_message(public_key: &str, message: &[u8], signature: &str) -> bool {
        let Ok(key_bytes) = hex::decode(public_key) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(signature) else {
            return false;
        };
        let (Ok(key), Ok(sig)) = (
            VerifyingKey::from_sec1_bytes(&key_bytes),
            Signature::from_slice(&sig_bytes),
        ) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }

    pub fn create_transaction(
        &self,
        to: &str,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction, ValidationError> {
        self.create_transaction_with_kind(TransactionKind::Transfer, to, amount, fee)
    }

    /// Builds, validates and signs a transaction from this wallet.
    pub fn create_transaction_with_kind(
        &self,
        kind: TransactionKind,
        to: &str,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction, ValidationError> {
        let to = normalize_address(to);
        if !is_valid_address(&to) {
            return Err(ValidationError::InvalidAddress(to));
        }
        if amount == 0 {
            return Err(ValidationError::InvalidAmount);
        }
        let mut tx = Transaction::new(&self.address, &to, amount, fee, kind);
        tx.validate_fields()?;
        self.sign_transaction(&mut tx)?;
        Ok(tx)
    }

    /// Signs the transaction hash and attaches the public key.
    pub fn sign_transaction(&self, tx: &mut Transaction) -> Result<(), ValidationError> {
        let digest = hex::decode(&tx.hash)
            .map_err(|_| ValidationError::HashMismatch(tx.id.clone()))?;
        let signature: Signature = self
            .signing_key
            .sign_prehash(&digest)
            .map_err(|e| ValidationError::MalformedSignature(e.to_string()))?;
        let signature = signature.normalize_s().unwrap_or(signature);
        tx.signature = Some(hex::encode(signature.to_bytes()));
        tx.public_key = Some(self.public_key.clone());
        Ok(())
    }

    /// Stable fingerprint of the public key, for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&sha256(self.public_key.as_bytes())[..4])
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .field("public_key", &self.public_key)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn generated_address_is_well_formed() {
        let wallet = Wallet::generate();
        assert!(is_valid_address(wallet.address()));
        assert_ne!(wallet.address(), ZERO_ADDRESS);
        assert_eq!(wallet.public_key().len(), 66);
    }

    #[test]
    fn import_round_trip_keeps_address() {
        let wallet = Wallet::generate();
        let imported = Wallet::import(&wallet.export_private_key()).unwrap();
        assert_eq!(imported.address(), wallet.address());
        assert_eq!(imported.public_key(), wallet.public_key());
    }

    #[test]
    fn import_is_deterministic() {
        let key = "01".repeat(32);
        let a = Wallet::import(&key).unwrap();
        let b = Wallet::import(&key).unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[test_case("" ; "empty")]
    #[test_case("abcd" ; "too short")]
    #[test_case(&"zz".repeat(32) ; "not hex")]
    #[test_case(&"00".repeat(32) ; "zero scalar")]
    #[test_case(&"ff".repeat(32) ; "above curve order")]
    fn invalid_keys_are_rejected(key: &str) {
        assert!(matches!(Wallet::import(key), Err(WalletError::InvalidKey(_))));
    }

    #[test_case(ZERO_ADDRESS, true)]
    #[test_case("0x00000000000000000000000000000000000000zz", false)]
    #[test_case("0000000000000000000000000000000000000000", false)]
    #[test_case("0x1234", false)]
    #[test_case("0xABCDEF0000000000000000000000000000000000", false ; "uppercase is not canonical")]
    #[test_case("0xabcdef0000000000000000000000000000000000", true ; "lowercase")]
    fn address_validation(address: &str, valid: bool) {
        assert_eq!(is_valid_address(address), valid);
    }

    #[test]
    fn persisted_wallet_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        let wallet = Wallet::generate_at(&path).unwrap();
        let loaded = Wallet::load(&path).unwrap();
        assert_eq!(loaded.address(), wallet.address());
        assert_eq!(loaded.path(), Some(path.as_path()));
    }

    #[test]
    fn regenerate_replaces_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        let mut wallet = Wallet::generate_at(&path).unwrap();
        let before = wallet.address().to_string();
        wallet.regenerate().unwrap();
        assert_ne!(wallet.address(), before);
        assert_eq!(Wallet::load(&path).unwrap().address(), wallet.address());
    }

    #[test]
    fn message_signatures_verify() {
        let wallet = Wallet::generate();
        let sig = wallet.sign_message(b"batch B-1 received");
        assert!(Wallet::verify_message(&wallet.public_key(), b"batch B-1 received", &sig));
        assert!(!Wallet::verify_message(&wallet.public_key(), b"batch B-2 received", &sig));
        assert!(!Wallet::verify_message("nothex", b"batch B-1 received", &sig));
    }

    #[test]
    fn transaction_validation_errors() {
        let wallet = Wallet::generate();
        let other = Wallet::generate();
        assert_eq!(
            wallet.create_transaction("bob", 1, 0).unwrap_err(),
            ValidationError::InvalidAddress("bob".into())
        );
        assert_eq!(
            wallet.create_transaction(other.address(), 0, 0).unwrap_err(),
            ValidationError::InvalidAmount
        );
        assert!(matches!(
            wallet.create_transaction(wallet.address(), 1, 0).unwrap_err(),
            ValidationError::SelfTransfer(_)
        ));
    }

    #[test]
    fn mixed_case_recipient_is_canonicalized() {
        let wallet = Wallet::generate();
        let other = Wallet::generate();
        let shouted = other.address().to_ascii_uppercase().replacen("0X", "0x", 1);

        let tx = wallet.create_transaction(&shouted, 5, 0).unwrap();
        assert_eq!(tx.receiver, other.address());
        tx.verify().unwrap();

        let own = wallet.address().to_ascii_uppercase().replacen("0X", "0x", 1);
        assert!(matches!(
            wallet.create_transaction(&own, 1, 0).unwrap_err(),
            ValidationError::SelfTransfer(_)
        ));
    }
}
