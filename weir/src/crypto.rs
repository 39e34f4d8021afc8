//! A collection of cryptographic primitives used by the protocol core.
//!
//! The exact implementations of these primitives are an implementation detail for this module
//! only and dependents should not care about the implementations. Everything that is signed
//! off-chain is first reduced to a keccak256 digest and then signed with a recoverable ECDSA
//! signature over secp256k1, so counterparties can be identified by address recovery alone.

use std::fmt::Display;

use anyhow::{Result, anyhow};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use serde::{
    Deserialize, Serialize,
    de::{self, Unexpected},
};
use sha3::{Digest, Keccak256};

use crate::types::Address;

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0; 32]);

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn compute<T: AsRef<[S]>, S: AsRef<[u8]>>(preimages: T) -> Hash {
        let mut hasher = Keccak256::new();
        for preimage in preimages.as_ref() {
            hasher.update(preimage.as_ref());
        }
        Self(hasher.finalize().into())
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

/// A recoverable ECDSA signature in Ethereum's 65-byte `(r, s, v)` layout, with `v` holding
/// the recovery id offset by 27.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

impl Signature {
    pub fn to_bytes(self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..64].copy_from_slice(&self.s);
        bytes[64] = self.v;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Signature> {
        let bytes: [u8; 65] = bytes
            .try_into()
            .map_err(|_| anyhow!("a signature must be exactly 65 bytes"))?;
        Ok(Signature {
            r: bytes[..32].try_into().unwrap(),
            s: bytes[32..64].try_into().unwrap(),
            v: bytes[64],
        })
    }

    /// Returns true if every byte of the signature is zero, the encoding used for "no
    /// signature yet" in participant-indexed signature lists.
    pub fn is_zero(&self) -> bool {
        *self == Signature::default()
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        hex::encode(self.to_bytes()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s)
            .map_err(|_| de::Error::invalid_value(Unexpected::Str(&s), &"a hex signature"))?;
        Signature::from_bytes(&bytes)
            .map_err(|_| de::Error::invalid_value(Unexpected::Str(&s), &"a signature"))
    }
}

/// The secret key type used as the basis of all signing in the node. The corresponding
/// Ethereum-style address can be derived from this.
#[derive(Debug, Clone, Copy)]
pub struct SecretKey {
    bytes: [u8; 32],
}

impl SecretKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<SecretKey> {
        let bytes: [u8; 32] = bytes.try_into()?;

        if bytes == [0; 32] {
            return Err(anyhow!("bytes are all zero"));
        }

        Ok(SecretKey { bytes })
    }

    pub fn from_hex(s: &str) -> Result<SecretKey> {
        let bytes_vec = hex::decode(s)?;
        Self::from_bytes(&bytes_vec)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    fn as_ecdsa(&self) -> SigningKey {
        // `SigningKey::from_bytes` can fail for two reasons:
        // 1. The bytes represent a zero integer. However, we validate this is not the case on
        //    construction.
        // 2. The bytes represent an integer less than the curve's modulus. However for ECDSA,
        //    the curve's order is equal to its modulus, so this is impossible.
        // Therefore, it is safe to unwrap here.
        SigningKey::from_bytes(&self.bytes.into()).unwrap()
    }

    /// The Ethereum-style address corresponding to this key: the trailing 20 bytes of the
    /// keccak256 hash of the uncompressed public key.
    pub fn address(&self) -> Address {
        public_key_to_address(VerifyingKey::from(&self.as_ecdsa()))
    }

    /// Signs a 32-byte digest, producing a recoverable signature.
    pub fn sign_prehash(&self, prehash: &Hash) -> Result<Signature> {
        let (sig, recovery_id) = self
            .as_ecdsa()
            .sign_prehash_recoverable(prehash.as_bytes())
            .map_err(|e| anyhow!("signing failed: {e}"))?;
        let r: [u8; 32] = sig.r().to_bytes().into();
        let s: [u8; 32] = sig.s().to_bytes().into();
        Ok(Signature {
            r,
            s,
            v: recovery_id.to_byte() + 27,
        })
    }
}

fn public_key_to_address(key: VerifyingKey) -> Address {
    // Remove the first byte before hashing - The first byte specifies the encoding tag.
    let bytes = key.to_encoded_point(false).as_bytes()[1..].to_owned();
    Address::from_slice(&Keccak256::digest(bytes)[12..32])
}

/// Prepends the standard `\x19Ethereum Signed Message:\n<len>` prefix to `message` and
/// hashes the result. Signing over the prefixed digest prevents a channel signature from
/// doubling as a transaction signature.
fn ethereum_prefixed_hash(message: &[u8]) -> Hash {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    Hash::compute([prefix.as_bytes(), message])
}

/// Signs `message` (conventionally a 32-byte digest of a channel artifact) under the
/// Ethereum message prefix.
pub fn sign_ethereum_message(message: &[u8], key: &SecretKey) -> Result<Signature> {
    key.sign_prehash(&ethereum_prefixed_hash(message))
}

/// Recovers the address which produced `signature` over the prefixed `message`.
pub fn recover_ethereum_message_signer(message: &[u8], signature: &Signature) -> Result<Address> {
    let digest = ethereum_prefixed_hash(message);
    let recovery_id = signature
        .v
        .checked_sub(27)
        .and_then(RecoveryId::from_byte)
        .ok_or_else(|| anyhow!("invalid recovery id {}", signature.v))?;
    let mut sig_bytes = [0u8; 64];
    sig_bytes[..32].copy_from_slice(&signature.r);
    sig_bytes[32..].copy_from_slice(&signature.s);
    let sig = EcdsaSignature::from_slice(&sig_bytes).map_err(|e| anyhow!("invalid signature: {e}"))?;
    let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &sig, recovery_id)
        .map_err(|e| anyhow!("could not recover signer: {e}"))?;
    Ok(public_key_to_address(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover() {
        let key = SecretKey::from_hex(
            "0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        let message = Hash::compute([b"hello"]);

        let sig = sign_ethereum_message(message.as_bytes(), &key).unwrap();
        let recovered = recover_ethereum_message_signer(message.as_bytes(), &sig).unwrap();

        assert_eq!(recovered, key.address());
    }

    #[test]
    fn known_address_for_key_one() {
        // Address corresponding to private key 0x...01.
        let key = SecretKey::from_hex(
            "0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        assert_eq!(
            key.address(),
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
                .parse::<Address>()
                .unwrap()
        );
    }

    #[test]
    fn signature_round_trips_through_bytes() {
        let key = SecretKey::from_hex(
            "0000000000000000000000000000000000000000000000000000000000000002",
        )
        .unwrap();
        let sig = sign_ethereum_message(b"payload", &key).unwrap();
        assert_eq!(sig, Signature::from_bytes(&sig.to_bytes()).unwrap());
    }
}
