//! Settings blob serialization
//!
//! The surrounding framework persists media settings as a small
//! tag-delimited text blob, one element per line:
//!
//! ```text
//! <IP>host</IP>
//! <Port>4059</Port>
//! <Protocol>0</Protocol>
//! ```
//!
//! Elements are emitted only when they differ from the defaults (TCP,
//! empty host, port 0) and absent elements fall back to those defaults on
//! parse. Tag names are case-insensitive, unknown tags are ignored and
//! malformed integers fail with a configuration error. The `Protocol`
//! ordinal is `0` for UDP and `1` for TCP.

use crate::error::{Error, Result};
use crate::types::Protocol;

/// Endpoint settings carried by the blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetSettings {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            protocol: Protocol::Tcp,
        }
    }
}

/// Serialize settings to the blob, skipping default values
pub fn serialize(settings: &NetSettings) -> String {
    let mut out = String::new();
    if !settings.host.is_empty() {
        out.push_str("<IP>");
        out.push_str(&settings.host);
        out.push_str("</IP>\n");
    }
    if settings.port != 0 {
        out.push_str("<Port>");
        out.push_str(&settings.port.to_string());
        out.push_str("</Port>\n");
    }
    if settings.protocol != Protocol::Tcp {
        out.push_str("<Protocol>");
        out.push_str(&settings.protocol.ordinal().to_string());
        out.push_str("</Protocol>\n");
    }
    out
}

/// Parse a settings blob. Absent elements keep their defaults.
pub fn parse(value: &str) -> Result<NetSettings> {
    let mut settings = NetSettings::default();
    for line in value.lines() {
        let Some((tag, body)) = split_element(line.trim()) else {
            continue;
        };
        if tag.eq_ignore_ascii_case("IP") {
            settings.host = body.to_string();
        } else if tag.eq_ignore_ascii_case("Port") {
            settings.port = body
                .trim()
                .parse()
                .map_err(|_| Error::Configuration(format!("Invalid port: {:?}", body)))?;
        } else if tag.eq_ignore_ascii_case("Protocol") {
            let ordinal: u8 = body
                .trim()
                .parse()
                .map_err(|_| Error::Configuration(format!("Invalid protocol: {:?}", body)))?;
            settings.protocol = Protocol::from_ordinal(ordinal)
                .ok_or_else(|| Error::Configuration(format!("Invalid protocol: {:?}", body)))?;
        }
        // Unknown tags are ignored.
    }
    Ok(settings)
}

/// Split `<Tag>body</Tag>` into `(Tag, body)`; anything else is skipped
fn split_element(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('<')?;
    let close = rest.find('>')?;
    let tag = &rest[..close];
    if tag.is_empty() || tag.starts_with('/') {
        return None;
    }
    let body = &rest[close + 1..];
    let end = format!("</{}>", tag);
    let body_end = body.len().checked_sub(end.len())?;
    if !body[body_end..].eq_ignore_ascii_case(&end) {
        return None;
    }
    Some((tag, &body[..body_end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let settings = NetSettings {
            host: "192.168.1.10".to_string(),
            port: 4059,
            protocol: Protocol::Udp,
        };
        let blob = serialize(&settings);
        assert_eq!(parse(&blob).unwrap(), settings);
    }

    #[test]
    fn test_defaults_are_omitted_and_restored() {
        let settings = NetSettings::default();
        assert_eq!(serialize(&settings), "");
        assert_eq!(parse("").unwrap(), settings);
    }

    #[test]
    fn test_tcp_protocol_not_serialized() {
        let settings = NetSettings {
            host: "host".to_string(),
            port: 1,
            protocol: Protocol::Tcp,
        };
        let blob = serialize(&settings);
        assert!(!blob.contains("Protocol"));
        assert_eq!(parse(&blob).unwrap().protocol, Protocol::Tcp);
    }

    #[test]
    fn test_unknown_tags_ignored() {
        let blob = "<IP>host</IP>\n<Color>red</Color>\n<Port>7</Port>\n";
        let settings = parse(blob).unwrap();
        assert_eq!(settings.host, "host");
        assert_eq!(settings.port, 7);
    }

    #[test]
    fn test_case_insensitive_tags() {
        let settings = parse("<ip>host</ip>\n<PORT>80</PORT>\n").unwrap();
        assert_eq!(settings.host, "host");
        assert_eq!(settings.port, 80);
    }

    #[test]
    fn test_malformed_port_fails() {
        assert!(matches!(
            parse("<Port>eighty</Port>"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            parse("<Port>99999</Port>"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_out_of_range_protocol_fails() {
        assert!(matches!(
            parse("<Protocol>7</Protocol>"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_protocol_ordinals_on_the_wire() {
        assert_eq!(parse("<Protocol>0</Protocol>").unwrap().protocol, Protocol::Udp);
        assert_eq!(parse("<Protocol>1</Protocol>").unwrap().protocol, Protocol::Tcp);
    }

    #[test]
    fn test_garbled_lines_skipped() {
        let settings = parse("<IP>host\nPort>5</Port>\n<>x</>\n").unwrap();
        // No well-formed element at all: everything stays default.
        assert_eq!(settings, NetSettings::default());
    }
}
