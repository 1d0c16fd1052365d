use serde::{Deserialize, Serialize};

/// Sent as an `IndexDone` payload when a rank has no more indices to report.
pub const RANK_DONE: u64 = u64::MAX;

/// The rank that collects results and decides when the group is finished.
pub const COORDINATOR: usize = 0;

/// Messages exchanged between ranks of the filter.
/// Every message between two given ranks arrives in the order it was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Sent once by each rank to the coordinator, describing the data it loaded.
    Handshake { candidates: u64, length: u32 },

    /// The coordinator gave up on the run.
    Abort { reason: String },

    /// A redundant candidate index, or `RANK_DONE`.
    IndexDone(u64),

    /// Asks a peer which range it would give away.
    ReservableRequest,

    /// An empty range means nothing to give.
    ReservableResponse { first: u64, end: u64 },

    /// Asks a peer for exactly this range.
    ReservationAttempt { first: u64, end: u64 },

    /// Whether the attempted range now belongs to the requester.
    ReservationResponse(bool),

    /// The coordinator has every result.
    Terminate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let messages = vec![
            Message::Handshake {
                candidates: 12,
                length: 7,
            },
            Message::IndexDone(RANK_DONE),
            Message::ReservationAttempt { first: 3, end: 9 },
            Message::Terminate,
        ];
        for message in messages {
            let json = serde_json::to_string(&message).unwrap();
            assert!(!json.contains('\n'));
            let parsed: Message = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, message);
        }
    }
}
