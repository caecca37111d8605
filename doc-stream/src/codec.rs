use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Serialize a document to its wire payload.
pub fn encode<T>(document: &T) -> Result<Vec<u8>, CodecError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(document).map_err(CodecError::Encode)
}

/// Deserialize a wire payload. Tombstones and other payload-less messages are rejected.
pub fn decode<T>(payload: Option<&[u8]>) -> Result<T, CodecError>
where
    T: DeserializeOwned,
{
    let Some(payload) = payload else {
        return Err(CodecError::EmptyPayload);
    };

    serde_json::from_slice(payload).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Doc {
        id: u32,
        title: String,
    }

    #[test]
    fn decodes_what_was_encoded() {
        let doc = Doc {
            id: 7,
            title: "hello".to_string(),
        };
        let payload = encode(&doc).expect("failed to encode");
        let decoded: Doc = decode(Some(&payload)).expect("failed to decode");
        assert_eq!(decoded, doc);
    }

    #[test]
    fn rejects_missing_payload() {
        match decode::<Doc>(None) {
            Err(CodecError::EmptyPayload) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_payload() {
        match decode::<Doc>(Some(b"{\"id\": \"not a number\"}")) {
            Err(CodecError::Decode(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
