//! EIP-712 typed-data digests and signature recovery for channel payments.
//!
//! A payment authorization is the typed struct `Payment { uint256 amount }`
//! signed under the domain
//! `{ name: "PaymentChannel", version: "1.0.0", chainId, verifyingContract }`
//! where `verifyingContract` is the channel's own address. Binding the
//! channel address and chain ID into the domain means a signature for one
//! channel (or one network) never validates against another.
//!
//! - Building the domain ([`payment_domain`])
//! - Computing the signing hash ([`signing_hash`], [`digest_preimage`])
//! - Recovering the signer with EIP-2 malleability protection ([`recover_payment_signer`])
//! - Off-channel helpers for the sender side ([`sign_payment`], [`encode_signature_hex`])

use std::borrow::Cow;

use alloy::primitives::{keccak256, Address, Signature, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol_types::{Eip712Domain, SolStruct};

use crate::error::SignatureError;
use crate::{ChainConfig, Payment};

/// Build the EIP-712 domain for a channel.
pub fn payment_domain(config: &ChainConfig, channel: Address) -> Eip712Domain {
    Eip712Domain {
        name: Some(Cow::Owned(config.eip712_domain_name.clone())),
        version: Some(Cow::Owned(config.eip712_domain_version.clone())),
        chain_id: Some(U256::from(config.chain_id)),
        verifying_contract: Some(channel),
        salt: None,
    }
}

/// Exact bytes that get hashed and signed: `0x19 0x01 || domainSeparator || hashStruct(Payment)`.
pub fn digest_preimage(config: &ChainConfig, channel: Address, amount: U256) -> [u8; 66] {
    let domain = payment_domain(config, channel);
    let payment = Payment { amount };

    let mut preimage = [0u8; 66];
    preimage[0] = 0x19;
    preimage[1] = 0x01;
    preimage[2..34].copy_from_slice(domain.separator().as_slice());
    preimage[34..66].copy_from_slice(payment.eip712_hash_struct().as_slice());
    preimage
}

/// Compute the EIP-712 signing hash for `amount` on `channel`.
pub fn signing_hash(config: &ChainConfig, channel: Address, amount: U256) -> B256 {
    let domain = payment_domain(config, channel);
    Payment { amount }.eip712_signing_hash(&domain)
}

/// secp256k1 curve order N / 2. Signatures with s above this are malleable (EIP-2).
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xDFE92F46681B20A0,
    0x5D576E7357A4501D,
    0xFFFFFFFFFFFFFFFF,
    0x7FFFFFFFFFFFFFFF,
]);

/// Recover the address that signed `amount` for `channel`.
///
/// Fails for anything that is not a canonical 65-byte `r || s || v`
/// signature. A well-formed signature by the wrong key, or over a different
/// amount, recovers some other address; comparing it to the expected signer
/// is the caller's job (see [`verify_payment_signature`]).
pub fn recover_payment_signer(
    config: &ChainConfig,
    channel: Address,
    amount: U256,
    signature_bytes: &[u8],
) -> Result<Address, SignatureError> {
    if signature_bytes.len() != 65 {
        return Err(SignatureError::Malformed(format!(
            "signature must be 65 bytes, got {}",
            signature_bytes.len()
        )));
    }

    // from_raw accepts v in {0, 1, 27, 28} and rejects anything else.
    let sig = Signature::from_raw(signature_bytes)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;

    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(SignatureError::HighS);
    }

    let hash = signing_hash(config, channel, amount);
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| SignatureError::Recovery(e.to_string()))
}

/// Recover the signer and require it to be `expected`.
pub fn verify_payment_signature(
    config: &ChainConfig,
    channel: Address,
    amount: U256,
    signature_bytes: &[u8],
    expected: Address,
) -> Result<(), SignatureError> {
    let recovered = recover_payment_signer(config, channel, amount, signature_bytes)?;
    if recovered != expected {
        return Err(SignatureError::SignerMismatch {
            expected,
            recovered,
        });
    }
    Ok(())
}

/// Sign a payment authorization. Runs on the sender's side, never inside a channel.
pub fn sign_payment(
    signer: &PrivateKeySigner,
    config: &ChainConfig,
    channel: Address,
    amount: U256,
) -> Result<Signature, alloy::signers::Error> {
    let hash = signing_hash(config, channel, amount);
    signer.sign_hash_sync(&hash)
}

/// Encode a Signature to a 0x-prefixed hex string (65 bytes, v = 27 or 28).
pub fn encode_signature_hex(sig: &Signature) -> String {
    format!("0x{}", alloy::hex::encode(sig.as_bytes()))
}

/// Decode a hex signature, with or without the 0x prefix.
pub fn decode_signature_hex(sig_hex: &str) -> Result<Vec<u8>, SignatureError> {
    alloy::hex::decode(sig_hex.strip_prefix("0x").unwrap_or(sig_hex))
        .map_err(|e| SignatureError::Malformed(format!("invalid hex signature: {e}")))
}

/// keccak256 of the EIP-712 domain type string, exposed for off-chain tooling.
pub fn domain_type_hash() -> B256 {
    keccak256("EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)")
}
