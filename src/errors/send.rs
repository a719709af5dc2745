/// Send-result classification
///
/// Nodes report rejections as free-form strings that differ between
/// implementations. They are mapped to a [`SendOutcome`] once, here, and the
/// broadcaster and confirmer only ever react to the outcome.
use super::ClientError;

/// How the transaction manager reacts to a send result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The node holds this nonce (ours or a competing transaction); confirmation decides later
    Accepted,
    /// Gas price too low for the node to accept; re-price and resend
    Underpriced,
    /// The node will never accept this exact payload
    Fatal,
    /// Sender cannot pay for the transaction right now
    InsufficientFunds,
    /// Network or node trouble, or a message nobody recognises
    Retryable,
}

impl SendOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendOutcome::Accepted => "accepted",
            SendOutcome::Underpriced => "underpriced",
            SendOutcome::Fatal => "fatal",
            SendOutcome::InsufficientFunds => "insufficient_funds",
            SendOutcome::Retryable => "retryable",
        }
    }
}

/// Already in the mempool, already mined, or replaced by a transaction we
/// may not know about. Checked first: "replacement transaction underpriced"
/// must not fall through to [`UNDERPRICED`].
const ACCEPTED: &[&str] = &[
    "already known",
    "known transaction",
    "already in mempool",
    "already imported",
    "nonce too low",
    "replacement transaction underpriced",
    "another transaction with same nonce",
    "too many transactions in the queue",
];

const UNDERPRICED: &[&str] = &[
    "transaction underpriced",
    "gas price too low",
    "is too low. there is another",
    "fee too low",
];

const INSUFFICIENT_FUNDS: &[&str] = &[
    "insufficient funds",
    "insufficient balance",
    "sender doesn't have enough funds",
];

const FATAL: &[&str] = &[
    "exceeds block gas limit",
    "exceeds current gas limit",
    "intrinsic gas too low",
    "invalid sender",
    "negative value",
    "oversized data",
    "nonce has max value",
    "gas uint64 overflow",
    "transaction type not supported",
    "invalid rlp",
    "invalid chain id",
];

fn matches_any(message: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| message.contains(pattern))
}

/// Classify a failed send
pub fn classify_send_error(error: &ClientError) -> SendOutcome {
    let message = match error {
        ClientError::Rpc(message) => message.to_lowercase(),
        ClientError::Timeout(_) | ClientError::Connection(_) | ClientError::Subscription(_) => {
            return SendOutcome::Retryable;
        }
    };

    if matches_any(&message, ACCEPTED) {
        SendOutcome::Accepted
    } else if matches_any(&message, UNDERPRICED) {
        SendOutcome::Underpriced
    } else if matches_any(&message, INSUFFICIENT_FUNDS) {
        SendOutcome::InsufficientFunds
    } else if matches_any(&message, FATAL) {
        SendOutcome::Fatal
    } else {
        SendOutcome::Retryable
    }
}

/// Classify the result of a send call
pub fn classify_send_result(result: &Result<(), ClientError>) -> SendOutcome {
    match result {
        Ok(()) => SendOutcome::Accepted,
        Err(error) => classify_send_error(error),
    }
}
