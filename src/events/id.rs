//! Replay-proof transfer identifier
//!
//! Mirrors the destination bridge's `getTransactionId`:
//! `keccak256(abi.encodePacked(blockHash, txHash, receiver, amount, uint32 logIndex))`.

use super::CrossEvent;
use crate::error::{FederatorError, FederatorResult};

use ethers::types::H256;
use sha3::{Digest, Keccak256};
use std::fmt;

/// Packed preimage length: 32 + 32 + 20 + 32 + 4
const PREIMAGE_LEN: usize = 120;

/// Identifier the destination uses for its processed-flag
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub [u8; 32]);

impl From<H256> for TransactionId {
    fn from(hash: H256) -> Self {
        Self(hash.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self)
    }
}

fn packed_preimage(event: &CrossEvent) -> FederatorResult<[u8; PREIMAGE_LEN]> {
    let log_index = u32::try_from(event.log_index).map_err(|_| {
        FederatorError::InvalidEvent(format!(
            "log index {} of tx {:?} does not fit uint32",
            event.log_index, event.transaction_hash
        ))
    })?;
    if event.block_hash.is_zero() || event.transaction_hash.is_zero() {
        return Err(FederatorError::InvalidEvent(format!(
            "event at block {} has an empty block or transaction hash",
            event.block_number
        )));
    }

    let mut preimage = [0u8; PREIMAGE_LEN];
    preimage[0..32].copy_from_slice(event.block_hash.as_bytes());
    preimage[32..64].copy_from_slice(event.transaction_hash.as_bytes());
    preimage[64..84].copy_from_slice(event.recipient.as_bytes());
    event.amount.to_big_endian(&mut preimage[84..116]);
    preimage[116..120].copy_from_slice(&log_index.to_be_bytes());
    Ok(preimage)
}

/// Compute the canonical id of `event`
pub fn compute_transaction_id(event: &CrossEvent) -> FederatorResult<TransactionId> {
    let preimage = packed_preimage(event)?;
    let digest = Keccak256::digest(preimage);

    let mut id = [0u8; 32];
    id.copy_from_slice(&digest);
    Ok(TransactionId(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::sample_event;
    use ethers::types::{Address, U256};

    #[test]
    fn test_keccak_matches_ethereum_variant() {
        // keccak256("") differs from NIST sha3-256("")
        assert_eq!(
            hex::encode(Keccak256::digest(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_preimage_layout() {
        let mut event = sample_event(5, 7);
        event.amount = U256::from(0x0102u64);
        let preimage = packed_preimage(&event).unwrap();

        assert_eq!(&preimage[0..32], event.block_hash.as_bytes());
        assert_eq!(&preimage[32..64], event.transaction_hash.as_bytes());
        assert_eq!(&preimage[64..84], event.recipient.as_bytes());
        assert_eq!(&preimage[114..116], &[0x01, 0x02]);
        assert_eq!(&preimage[116..120], &[0, 0, 0, 7]);
    }

    #[test]
    fn test_id_is_deterministic() {
        let event = sample_event(10, 1);
        assert_eq!(
            compute_transaction_id(&event).unwrap(),
            compute_transaction_id(&event.clone()).unwrap()
        );
    }

    #[test]
    fn test_id_ignores_fields_outside_the_scheme() {
        let event = sample_event(10, 1);
        let mut other = event.clone();
        other.symbol = "DAI".to_string();
        other.extra_data = vec![1, 2, 3].into();
        other.token_address = Address::repeat_byte(0x99);
        assert_eq!(
            compute_transaction_id(&event).unwrap(),
            compute_transaction_id(&other).unwrap()
        );
    }

    #[test]
    fn test_id_changes_with_each_keyed_field() {
        let base = sample_event(10, 1);
        let base_id = compute_transaction_id(&base).unwrap();

        let mut changed = base.clone();
        changed.recipient = Address::repeat_byte(0x33);
        assert_ne!(compute_transaction_id(&changed).unwrap(), base_id);

        let mut changed = base.clone();
        changed.amount += U256::one();
        assert_ne!(compute_transaction_id(&changed).unwrap(), base_id);

        let mut changed = base.clone();
        changed.log_index += 1;
        assert_ne!(compute_transaction_id(&changed).unwrap(), base_id);

        let mut changed = base.clone();
        changed.block_hash = H256::repeat_byte(0x44);
        assert_ne!(compute_transaction_id(&changed).unwrap(), base_id);

        let mut changed = base;
        changed.transaction_hash = H256::repeat_byte(0x55);
        assert_ne!(compute_transaction_id(&changed).unwrap(), base_id);
    }

    #[test]
    fn test_log_index_overflow_is_invalid() {
        let mut event = sample_event(10, 1);
        event.log_index = u64::from(u32::MAX) + 1;
        assert!(matches!(
            compute_transaction_id(&event),
            Err(FederatorError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_display_is_prefixed_hex() {
        let id = TransactionId([0xab; 32]);
        assert_eq!(id.to_string(), format!("0x{}", "ab".repeat(32)));
    }
}
