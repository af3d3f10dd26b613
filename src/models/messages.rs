use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as, DisplayFromStr};

use crate::awareness::{AwarenessEntry, AwarenessState, ClientId};

/// Frames sent by a client on a document socket.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// The client's state vector; answered with `sync-step2`.
    SyncStep1 {
        #[serde_as(as = "Base64")]
        state_vector: Vec<u8>,
    },
    /// Operations the server lacks, in answer to the server's `sync-step1`.
    SyncStep2 {
        #[serde_as(as = "Base64")]
        delta: Vec<u8>,
    },
    Update {
        #[serde_as(as = "Base64")]
        delta: Vec<u8>,
    },
    /// New presence, or `null` to clear it.
    AwarenessUpdate { state: Option<AwarenessState> },
    /// Explicit disconnect.
    Leave,
}

/// Frames sent by the server on a document socket.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// `epoch` names the in-memory incarnation of the document. It changes
    /// when the document was evicted and hydrated again; a client holding
    /// history from another epoch must drop it.
    Hello {
        client_id: ClientId,
        room_id: String,
        file_name: String,
        #[serde_as(as = "DisplayFromStr")]
        epoch: u64,
    },
    SyncStep1 {
        #[serde_as(as = "Base64")]
        state_vector: Vec<u8>,
    },
    SyncStep2 {
        #[serde_as(as = "Base64")]
        delta: Vec<u8>,
    },
    Update {
        #[serde_as(as = "Base64")]
        delta: Vec<u8>,
    },
    AwarenessUpdate {
        updated: Vec<AwarenessEntry>,
        removed: Vec<ClientId>,
    },
    AwarenessSnapshot { entries: Vec<AwarenessEntry> },
    Error { code: ErrorCode, message: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    MalformedFrame,
    RejectedDelta,
    InvalidAwareness,
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_use_kebab_case_tags_and_base64_payloads() {
        let json = serde_json::to_value(ClientMessage::SyncStep1 {
            state_vector: vec![0xa0],
        })
        .unwrap();
        assert_eq!(json["type"], "sync-step1");
        assert_eq!(json["stateVector"], "oA==");

        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"awareness-update","state":{"name":"ann","cursor":{"anchor":1,"head":4}}}"#)
                .unwrap();
        match parsed {
            ClientMessage::AwarenessUpdate { state: Some(state) } => {
                assert_eq!(state.name, "ann");
                assert_eq!(state.color, "");
            }
            other => panic!("unexpected {other:?}"),
        }

        let leave: ClientMessage = serde_json::from_str(r#"{"type":"leave"}"#).unwrap();
        assert_eq!(leave, ClientMessage::Leave);
    }

    #[test]
    fn error_frames_carry_a_code() {
        let json = serde_json::to_value(ServerMessage::Error {
            code: ErrorCode::RejectedDelta,
            message: "gap".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "rejected-delta");
    }

    #[test]
    fn hello_carries_the_epoch_as_a_string() {
        let hello = ServerMessage::Hello {
            client_id: 3,
            room_id: "r".into(),
            file_name: "a.txt".into(),
            epoch: u64::MAX,
        };
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["epoch"], u64::MAX.to_string());
        assert_eq!(json["fileName"], "a.txt");
        let back: ServerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, hello);
    }
}
