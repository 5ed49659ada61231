//! ABI calldata for the destination bridge and its multisig wallet

use crate::error::{FederatorError, FederatorResult};
use crate::events::{CrossEvent, TransactionId};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;

pub const PROCESSED_SIGNATURE: &str = "processed(bytes32)";
pub const GET_TRANSACTION_ID_SIGNATURE: &str =
    "getTransactionId(bytes32,bytes32,address,uint256,uint32)";
pub const ACCEPT_TRANSFER_SIGNATURE: &str =
    "acceptTransfer(address,address,uint256,string,bytes32,bytes32,uint32,uint8,uint256)";
pub const ACCEPT_TRANSFER_AT_SIGNATURE: &str =
    "acceptTransferAt(address,address,uint256,string,bytes32,bytes32,uint32,uint8,uint256,bytes)";
pub const SUBMIT_TRANSACTION_SIGNATURE: &str = "submitTransaction(address,uint256,bytes)";

fn call(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(tokens));
    Bytes::from(data)
}

fn log_index_token(event: &CrossEvent) -> FederatorResult<Token> {
    let log_index = u32::try_from(event.log_index).map_err(|_| {
        FederatorError::InvalidEvent(format!("log index {} does not fit uint32", event.log_index))
    })?;
    Ok(Token::Uint(U256::from(log_index)))
}

/// `processed(id)`
pub fn processed(id: TransactionId) -> Bytes {
    call(PROCESSED_SIGNATURE, &[Token::FixedBytes(id.0.to_vec())])
}

/// `getTransactionId(blockHash, txHash, receiver, amount, logIndex)`
pub fn get_transaction_id(event: &CrossEvent) -> FederatorResult<Bytes> {
    Ok(call(
        GET_TRANSACTION_ID_SIGNATURE,
        &[
            Token::FixedBytes(event.block_hash.as_bytes().to_vec()),
            Token::FixedBytes(event.transaction_hash.as_bytes().to_vec()),
            Token::Address(event.recipient),
            Token::Uint(event.amount),
            log_index_token(event)?,
        ],
    ))
}

/// `acceptTransfer` or, when the event carries user data, `acceptTransferAt`
pub fn accept_transfer(event: &CrossEvent) -> FederatorResult<Bytes> {
    let mut tokens = vec![
        Token::Address(event.token_address),
        Token::Address(event.recipient),
        Token::Uint(event.amount),
        Token::String(event.symbol.clone()),
        Token::FixedBytes(event.block_hash.as_bytes().to_vec()),
        Token::FixedBytes(event.transaction_hash.as_bytes().to_vec()),
        log_index_token(event)?,
        Token::Uint(U256::from(event.decimals)),
        Token::Uint(event.granularity),
    ];

    if event.extra_data.is_empty() {
        Ok(call(ACCEPT_TRANSFER_SIGNATURE, &tokens))
    } else {
        tokens.push(Token::Bytes(event.extra_data.to_vec()));
        Ok(call(ACCEPT_TRANSFER_AT_SIGNATURE, &tokens))
    }
}

/// Multisig proposal of `data` against `destination`, with zero value
pub fn submit_transaction(destination: Address, data: Bytes) -> Bytes {
    call(
        SUBMIT_TRANSACTION_SIGNATURE,
        &[
            Token::Address(destination),
            Token::Uint(U256::zero()),
            Token::Bytes(data.to_vec()),
        ],
    )
}

/// Decode a single `bool` return value
pub fn decode_bool(output: &[u8]) -> FederatorResult<bool> {
    match abi::decode(&[ParamType::Bool], output).as_deref() {
        Ok([Token::Bool(value)]) => Ok(*value),
        _ => Err(FederatorError::Internal(format!(
            "cannot decode bool from 0x{}",
            hex::encode(output)
        ))),
    }
}

/// Decode a single `bytes32` return value
pub fn decode_bytes32(output: &[u8]) -> FederatorResult<TransactionId> {
    match abi::decode(&[ParamType::FixedBytes(32)], output).as_deref() {
        Ok([Token::FixedBytes(bytes)]) if bytes.len() == 32 => {
            let mut id = [0u8; 32];
            id.copy_from_slice(bytes);
            Ok(TransactionId(id))
        }
        _ => Err(FederatorError::Internal(format!(
            "cannot decode bytes32 from 0x{}",
            hex::encode(output)
        ))),
    }
}
