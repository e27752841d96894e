//! Lease protocol datagrams.
//!
//! Every datagram carries one message of four newline-terminated fields:
//!
//! ```text
//! <TYPE>\n<service name>\n<port>\n<STATUS>\n
//! ```
//!
//! Requests carry `SUCCESS` as a placeholder status; responses echo the
//! service name and carry the relevant port, or 0.

use crate::error::ProtocolError;
use std::fmt;
use std::str::FromStr;

/// Largest datagram either side sends or accepts.
pub const MAX_DATAGRAM_SIZE: usize = 1024;
/// Longest service name; leaves room for the other three fields.
pub const MAX_SERVICE_NAME_LENGTH: usize = MAX_DATAGRAM_SIZE - 64;

/// Reject a service name that cannot travel in a single field.
pub fn check_service_name(name: &str) -> Result<(), ProtocolError> {
    if name.contains(['\n', '\r']) {
        return Err(ProtocolError::Malformed(format!(
            "service name {name:?} contains a line break"
        )));
    }
    if name.len() > MAX_SERVICE_NAME_LENGTH {
        return Err(ProtocolError::TooLarge {
            size: name.len(),
            max: MAX_SERVICE_NAME_LENGTH,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    RequestPort,
    KeepAlive,
    ClosePort,
    LookupPort,
    Stop,
    Response,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::RequestPort => "REQUEST_PORT",
            MessageType::KeepAlive => "KEEP_ALIVE",
            MessageType::ClosePort => "CLOSE_PORT",
            MessageType::LookupPort => "LOOKUP_PORT",
            MessageType::Stop => "STOP",
            MessageType::Response => "RESPONSE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUEST_PORT" => Ok(MessageType::RequestPort),
            "KEEP_ALIVE" => Ok(MessageType::KeepAlive),
            "CLOSE_PORT" => Ok(MessageType::ClosePort),
            "LOOKUP_PORT" => Ok(MessageType::LookupPort),
            "STOP" => Ok(MessageType::Stop),
            "RESPONSE" => Ok(MessageType::Response),
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    AllPortsBusy,
    ServiceNotFound,
    UndefinedError,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "SUCCESS",
            Status::AllPortsBusy => "ALL_PORTS_BUSY",
            Status::ServiceNotFound => "SERVICE_NOT_FOUND",
            Status::UndefinedError => "UNDEFINED_ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Status::Success),
            "ALL_PORTS_BUSY" => Ok(Status::AllPortsBusy),
            "SERVICE_NOT_FOUND" => Ok(Status::ServiceNotFound),
            "UNDEFINED_ERROR" => Ok(Status::UndefinedError),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

/// One lease protocol message, request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrsMessage {
    pub msg_type: MessageType,
    pub service_name: String,
    pub port: u16,
    pub status: Status,
}

impl PrsMessage {
    pub fn request(msg_type: MessageType, service_name: &str, port: u16) -> Self {
        Self {
            msg_type,
            service_name: service_name.to_string(),
            port,
            status: Status::Success,
        }
    }

    pub fn response(service_name: &str, port: u16, status: Status) -> Self {
        Self {
            msg_type: MessageType::Response,
            service_name: service_name.to_string(),
            port,
            status,
        }
    }

    /// Reply sent when a request cannot be decoded or handled.
    pub fn undefined_error() -> Self {
        Self::response("", 0, Status::UndefinedError)
    }

    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}\n",
            self.msg_type, self.service_name, self.port, self.status
        )
        .into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::TooLarge {
                size: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        let mut fields = text.split('\n').map(|f| f.strip_suffix('\r').unwrap_or(f));

        let msg_type = fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or(ProtocolError::MissingField("type"))?
            .parse::<MessageType>()?;
        let service_name = fields
            .next()
            .ok_or(ProtocolError::MissingField("service name"))?;
        let port_field = fields.next().ok_or(ProtocolError::MissingField("port"))?;
        let port = port_field
            .parse::<u16>()
            .map_err(|_| ProtocolError::InvalidNumber {
                field: "port",
                value: port_field.to_string(),
            })?;
        let status = fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or(ProtocolError::MissingField("status"))?
            .parse::<Status>()?;

        // Only the empty remainder after the final terminator may follow.
        if fields.any(|f| !f.is_empty()) {
            return Err(ProtocolError::Malformed(
                "extra fields after status".to_string(),
            ));
        }

        Ok(Self {
            msg_type,
            service_name: service_name.to_string(),
            port,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let msg = PrsMessage::request(MessageType::KeepAlive, "SD Server", 40001);
        assert_eq!(msg.encode(), b"KEEP_ALIVE\nSD Server\n40001\nSUCCESS\n");
    }

    #[test]
    fn test_decode_response() {
        let msg = PrsMessage::decode(b"RESPONSE\nSD Server\n0\nALL_PORTS_BUSY\n").expect("valid");
        assert_eq!(
            msg,
            PrsMessage::response("SD Server", 0, Status::AllPortsBusy)
        );
    }

    #[test]
    fn test_decode_tolerates_crlf() {
        let msg = PrsMessage::decode(b"LOOKUP_PORT\r\nFT Server\r\n0\r\nSUCCESS\r\n").expect("valid");
        assert_eq!(msg.msg_type, MessageType::LookupPort);
        assert_eq!(msg.service_name, "FT Server");
    }

    #[test]
    fn test_stop_with_empty_name() {
        let msg = PrsMessage::request(MessageType::Stop, "", 0);
        let decoded = PrsMessage::decode(&msg.encode()).expect("valid");
        assert_eq!(decoded.msg_type, MessageType::Stop);
        assert!(decoded.service_name.is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            PrsMessage::decode(b"GRAB_PORT\nX\n0\nSUCCESS\n"),
            Err(ProtocolError::UnknownMessageType(_))
        ));
        assert!(matches!(
            PrsMessage::decode(b"KEEP_ALIVE\nX\n70000\nSUCCESS\n"),
            Err(ProtocolError::InvalidNumber { field: "port", .. })
        ));
        assert!(matches!(
            PrsMessage::decode(b"KEEP_ALIVE\nX\n1\n"),
            Err(ProtocolError::MissingField("status"))
        ));
        assert!(matches!(
            PrsMessage::decode(b""),
            Err(ProtocolError::MissingField("type"))
        ));
        assert!(matches!(
            PrsMessage::decode(&[0xff, 0xfe, b'\n']),
            Err(ProtocolError::InvalidUtf8)
        ));
        assert!(PrsMessage::decode(b"STOP\n\n0\nSUCCESS\nextra\n").is_err());
    }

    #[test]
    fn test_decode_rejects_oversized() {
        let big = vec![b'a'; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(
            PrsMessage::decode(&big),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_service_name_must_fit_one_field() {
        assert!(check_service_name("SD Server").is_ok());
        assert!(check_service_name("").is_ok());
        assert!(matches!(
            check_service_name("SD\nServer"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            check_service_name("SD Server\r"),
            Err(ProtocolError::Malformed(_))
        ));
        let long = "x".repeat(MAX_SERVICE_NAME_LENGTH + 1);
        assert!(matches!(
            check_service_name(&long),
            Err(ProtocolError::TooLarge { .. })
        ));

        // The longest allowed name still encodes within one datagram.
        let longest = "x".repeat(MAX_SERVICE_NAME_LENGTH);
        let msg = PrsMessage::response(&longest, 65535, Status::ServiceNotFound);
        assert!(msg.encode().len() <= MAX_DATAGRAM_SIZE);
        assert_eq!(PrsMessage::decode(&msg.encode()).expect("decodes"), msg);
    }
}
