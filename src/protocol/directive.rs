//! Host directives.
//!
//! The host addresses the link with plain message payloads: the literals
//! `Connect` and `Disconnect` are control words, anything else is data.

use bytes::Bytes;

/// Control word that starts (or restarts) a connection attempt.
pub const CONNECT_KEYWORD: &str = "Connect";
/// Control word that tears the connection down.
pub const DISCONNECT_KEYWORD: &str = "Disconnect";

/// A request from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Scan for the configured device and connect to it.
    Connect,
    /// Stop scanning and drop any connection.
    Disconnect,
    /// Write a payload to the peripheral.
    Send(Bytes),
}

impl Directive {
    /// Interpret a host message payload.
    ///
    /// Control words are matched exactly; `"connect"` is sent as data.
    pub fn from_payload(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        if payload == CONNECT_KEYWORD.as_bytes() {
            Self::Connect
        } else if payload == DISCONNECT_KEYWORD.as_bytes() {
            Self::Disconnect
        } else {
            Self::Send(payload)
        }
    }
}

impl From<&str> for Directive {
    fn from(payload: &str) -> Self {
        Self::from_payload(Bytes::copy_from_slice(payload.as_bytes()))
    }
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "{}", CONNECT_KEYWORD),
            Self::Disconnect => write!(f, "{}", DISCONNECT_KEYWORD),
            Self::Send(data) => write!(f, "Send({} bytes)", data.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_words() {
        assert_eq!(Directive::from("Connect"), Directive::Connect);
        assert_eq!(Directive::from("Disconnect"), Directive::Disconnect);
    }

    #[test]
    fn test_everything_else_is_data() {
        assert_eq!(
            Directive::from("connect"),
            Directive::Send(Bytes::from_static(b"connect"))
        );
        assert_eq!(
            Directive::from_payload(vec![0x01u8, 0x02]),
            Directive::Send(Bytes::from_static(&[0x01, 0x02]))
        );
        assert_eq!(Directive::from(""), Directive::Send(Bytes::new()));
    }

    #[test]
    fn test_display() {
        assert_eq!(Directive::Connect.to_string(), "Connect");
        assert_eq!(
            Directive::Send(Bytes::from_static(b"abc")).to_string(),
            "Send(3 bytes)"
        );
    }
}
