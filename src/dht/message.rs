use serde_derive::{Deserialize, Serialize};
use serde_bytes::Bytes;

/// KRPC error code used to turn away queries we do not serve.
pub const SERVER_ERROR: i64 = 202;
pub const SERVER_ERROR_MESSAGE: &[u8] = b"Server Error";

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub enum MessageType {
    #[serde(rename = "q")]
    Request,
    #[serde(rename = "r")]
    Response,
    #[serde(rename = "e")]
    Error,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    #[serde(skip)]
    None,
    FindNode,
    GetPeers,
    AnnouncePeer,
    #[serde(other)]
    Unknown,
}

impl QueryType {
    fn none() -> QueryType {
        Self::None
    }

    fn is_none(&self) -> bool {
        *self == QueryType::None
    }
}

/// Query arguments. Everything is optional on the wire; handlers decide what they require.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Request<'a> {
    #[serde(borrow)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<&'a Bytes>,
    #[serde(borrow)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<&'a Bytes>,
    #[serde(borrow)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<&'a Bytes>,
    // kept wide so out-of-range ports still decode and can be rejected by the handler
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implied_port: Option<i64>,
    #[serde(borrow)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<&'a Bytes>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Response<'a> {
    #[serde(borrow)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<&'a Bytes>,
    #[serde(borrow)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<&'a Bytes>,
    #[serde(borrow)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<&'a Bytes>,
}

/// `[code, message]` list carried under the `e` key.
#[derive(Serialize, Debug)]
pub struct ErrorReply<'a>(pub i64, pub &'a Bytes);

#[derive(Serialize, Deserialize, Debug)]
pub struct Message<'a> {
    #[serde(rename = "t")]
    #[serde(borrow)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<&'a Bytes>,
    #[serde(rename = "y")]
    pub message_type: MessageType,
    #[serde(rename = "q")]
    #[serde(default = "QueryType::none")]
    #[serde(skip_serializing_if = "QueryType::is_none")]
    pub query_type: QueryType,
    #[serde(rename = "a")]
    #[serde(borrow)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Request<'a>>,
    #[serde(rename = "r")]
    #[serde(borrow)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Response<'a>>,
}

/// Outbound error reply. Inbound errors are recognised by `y` alone, their `e` is skipped.
#[derive(Serialize, Debug)]
pub struct ErrorMessage<'a> {
    #[serde(rename = "t")]
    pub transaction_id: &'a Bytes,
    #[serde(rename = "y")]
    pub message_type: MessageType,
    #[serde(rename = "e")]
    pub error: ErrorReply<'a>,
}

impl<'a> Message<'a> {
    pub fn query(transaction_id: &'a [u8], query_type: QueryType, request: Request<'a>) -> Self {
        Message {
            transaction_id: Some(Bytes::new(transaction_id)),
            message_type: MessageType::Request,
            query_type,
            request: Some(request),
            response: None,
        }
    }

    pub fn response(transaction_id: &'a [u8], response: Response<'a>) -> Self {
        Message {
            transaction_id: Some(Bytes::new(transaction_id)),
            message_type: MessageType::Response,
            query_type: QueryType::None,
            request: None,
            response: Some(response),
        }
    }

}

impl<'a> ErrorMessage<'a> {
    pub fn server_error(transaction_id: &'a [u8]) -> Self {
        ErrorMessage {
            transaction_id: Bytes::new(transaction_id),
            message_type: MessageType::Error,
            error: ErrorReply(SERVER_ERROR, Bytes::new(SERVER_ERROR_MESSAGE)),
        }
    }
}

/// Rejects bencode nested deeper than `max_depth` without decoding it.
///
/// The decoder recurses once per list or dict, so unchecked input could exhaust the stack.
/// Other syntax errors are left for the decoder to report.
pub fn check_nesting(raw: &[u8], max_depth: usize) -> bool {
    let mut depth = 0usize;
    let mut pos = 0;

    while pos < raw.len() {
        match raw[pos] {
            b'd' | b'l' => {
                depth += 1;
                if depth > max_depth {
                    return false;
                }
                pos += 1;
            }
            b'e' => {
                depth = depth.saturating_sub(1);
                pos += 1;
            }
            b'i' => match raw[pos..].iter().position(|&b| b == b'e') {
                Some(end) => pos += end + 1,
                None => return true,
            },
            b'0'..=b'9' => {
                let colon = match raw[pos..].iter().position(|&b| b == b':') {
                    Some(colon) => pos + colon,
                    None => return true,
                };
                let length = match std::str::from_utf8(&raw[pos..colon]).ok().and_then(|l| l.parse::<usize>().ok()) {
                    Some(length) => length,
                    None => return true,
                };
                pos = (colon + 1).saturating_add(length);
            }
            _ => return true,
        }
    }

    true
}

#[cfg(test)]
mod test {
    use super::{check_nesting, ErrorMessage, Message, MessageType, QueryType};

    #[test]
    fn test_request_decode() {
        let raw = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaa9:info_hash20:bbbbbbbbbbbbbbbbbbbb4:porti70000e5:token2:bbe1:q13:announce_peer1:t2:001:v4:UT001:y1:qe";
        let message = serde_bencoded::from_bytes::<Message>(&raw[..]).expect("should decode");
        assert_eq!(message.message_type, MessageType::Request);
        assert_eq!(message.query_type, QueryType::AnnouncePeer);
        let request = message.request.expect("arguments");
        assert_eq!(request.port, Some(70000));
        assert_eq!(request.implied_port, None);
        assert_eq!(request.token.map(|t| t.as_ref()), Some(&b"bb"[..]));
    }

    #[test]
    fn test_unknown_query_decodes() {
        let raw = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:ping1:t2:xy1:y1:qe";
        let message = serde_bencoded::from_bytes::<Message>(&raw[..]).expect("should decode");
        assert_eq!(message.query_type, QueryType::Unknown);
    }

    #[test]
    fn test_server_error_encode() {
        let encoded = serde_bencode::to_bytes(&ErrorMessage::server_error(b"xy")).unwrap();
        assert_eq!(encoded, b"d1:eli202e12:Server Errore1:t2:xy1:y1:ee".to_vec());
    }

    #[test]
    fn test_error_decode() {
        let message = serde_bencoded::from_bytes::<Message>(&b"d1:eli201e5:Errore1:t2:aa1:y1:ee"[..]).expect("should decode");
        assert_eq!(message.message_type, MessageType::Error);
        assert_eq!(message.transaction_id.map(|t| t.as_ref()), Some(&b"aa"[..]));

        let message = serde_bencoded::from_bytes::<Message>(&b"d1:t2:aa1:y1:e1:eli201e5:Erroree"[..]).expect("should decode");
        assert_eq!(message.message_type, MessageType::Error);
    }

    #[test]
    fn test_nesting_limit() {
        assert!(check_nesting(b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:ping1:t2:xy1:y1:qe", 4));
        // brackets inside strings and integers don't count
        assert!(check_nesting(b"d1:v6:llllll1:ni-12ee", 1));
        assert!(check_nesting(b"lllleeee", 4));
        assert!(!check_nesting(b"llllleeeee", 4));

        let mut deep = b"d1:v".to_vec();
        deep.extend(std::iter::repeat(b'l').take(60000));
        assert!(!check_nesting(&deep, 32));

        assert!(check_nesting(b"99999999999999999999999:x", 4));
        assert!(check_nesting(b"this is not bencode", 4));
    }
}
