use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use crate::command::CubeCommand;

pub const LF: u8 = b'\n';
pub const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ack,            // A:
    Configuration,  // C:
    Ntp,            // F:
    Hello,          // H:
    DeviceList,     // L:
    Metadata,       // M:
    NewDevice,      // N:
    SendResult,     // S:
}

impl MessageType {
    pub fn from_tag(tag: &str) -> Option<MessageType> {
        match tag {
            "A" => Some(MessageType::Ack),
            "C" => Some(MessageType::Configuration),
            "F" => Some(MessageType::Ntp),
            "H" => Some(MessageType::Hello),
            "L" => Some(MessageType::DeviceList),
            "M" => Some(MessageType::Metadata),
            "N" => Some(MessageType::NewDevice),
            "S" => Some(MessageType::SendResult),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            MessageType::Ack => "A",
            MessageType::Configuration => "C",
            MessageType::Ntp => "F",
            MessageType::Hello => "H",
            MessageType::DeviceList => "L",
            MessageType::Metadata => "M",
            MessageType::NewDevice => "N",
            MessageType::SendResult => "S",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed line: {0}")]
    Malformed(String),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("multi-part message out of sequence: expected part {expected}, got {got}")]
    OutOfSequence { expected: u8, got: u8 },
}

/// A decoded inbound message: a type tag plus ordered string properties.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: MessageType,
    properties: Vec<(String, String)>,
    raw: String,
}

impl Message {
    pub fn new(kind: MessageType, properties: Vec<(String, String)>, raw: impl Into<String>) -> Self {
        Self { kind, properties, raw: raw.into() }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Splits the property list into records. A record starts at every
    /// property whose key is one of `starts`; properties before the first
    /// start key belong to no record and are skipped.
    pub fn records<'a>(&'a self, starts: &[&str]) -> Vec<Vec<(&'a str, &'a str)>> {
        let mut records: Vec<Vec<(&str, &str)>> = Vec::new();
        for (key, value) in &self.properties {
            if starts.contains(&key.as_str()) {
                records.push(Vec::new());
            }
            if let Some(current) = records.last_mut() {
                current.push((key.as_str(), value.as_str()));
            }
        }
        records
    }
}

/// Converts outbound commands to wire bytes and inbound lines to messages.
///
/// `decode` may keep a partial accumulator for messages spread over several
/// lines; it returns `Ok(None)` until the message is complete. After any
/// error the caller resets the codec and keeps reading.
pub trait MessageCodec: Send {
    fn encode(&self, command: &CubeCommand) -> Bytes;
    fn decode(&mut self, line: &str) -> Result<Option<Message>, ParseError>;
    fn reset(&mut self);
}

#[derive(Debug)]
struct PartialMessage {
    next_index: u8,
    count: u8,
    body: String,
}

/// Text rendition of the gateway protocol.
///
/// Inbound: `<TAG>:<key>=<value>,<key>=<value>...`; metadata arrives in parts
/// as `M:<index>,<count>,<pairs>`. Outbound: lower-case tags with positional
/// arguments, CRLF terminated.
#[derive(Debug, Default)]
pub struct TextCodec {
    partial: Option<PartialMessage>,
}

impl TextCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_metadata_part(&mut self, body: &str) -> Result<Option<Message>, ParseError> {
        if body.is_empty() {
            self.partial = None;
            return Ok(Some(Message::new(MessageType::Metadata, Vec::new(), "M:")));
        }
        let mut it = body.splitn(3, ',');
        let index = parse_part_number(it.next(), body)?;
        let count = parse_part_number(it.next(), body)?;
        let pairs = it.next().unwrap_or("");
        if count == 0 || index >= count {
            return Err(ParseError::Malformed(format!("M:{}", body)));
        }

        let mut partial = match self.partial.take() {
            _ if index == 0 => PartialMessage { next_index: 0, count, body: String::new() },
            Some(p) if p.next_index == index && p.count == count => p,
            Some(p) => {
                return Err(ParseError::OutOfSequence { expected: p.next_index, got: index });
            }
            None => return Err(ParseError::OutOfSequence { expected: 0, got: index }),
        };

        if !pairs.is_empty() {
            if !partial.body.is_empty() {
                partial.body.push(',');
            }
            partial.body.push_str(pairs);
        }

        if index + 1 == partial.count {
            let properties = parse_pairs(&partial.body)?;
            let raw = format!("M:{}", partial.body);
            Ok(Some(Message::new(MessageType::Metadata, properties, raw)))
        } else {
            partial.next_index = index + 1;
            self.partial = Some(partial);
            Ok(None)
        }
    }
}

impl MessageCodec for TextCodec {
    fn encode(&self, command: &CubeCommand) -> Bytes {
        let mut out = BytesMut::with_capacity(32);
        let line = match command {
            CubeCommand::ListDevices => "l:".to_string(),
            CubeCommand::RequestConfig { rf_address } => format!("c:{}", rf_address),
            CubeCommand::Ntp { servers } if servers.is_empty() => "f:".to_string(),
            CubeCommand::Ntp { servers } => format!("f:{}", servers.join(",")),
            CubeCommand::SetPoint { rf_address, room_id, mode, temperature } => {
                format!("s:{},{},{},{:.1}", rf_address, room_id, mode, temperature)
            }
            CubeCommand::DeleteDevice { rf_address, force } => {
                format!("t:{},{}", rf_address, u8::from(*force))
            }
            CubeCommand::Inclusion => "n:".to_string(),
            CubeCommand::Reload => "q:".to_string(),
            CubeCommand::ResetConfig => "a:".to_string(),
        };
        out.extend_from_slice(line.as_bytes());
        out.put_slice(CRLF);
        out.freeze()
    }

    fn decode(&mut self, line: &str) -> Result<Option<Message>, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (tag, body) = line
            .split_once(':')
            .ok_or_else(|| ParseError::Malformed(line.to_string()))?;
        let kind = MessageType::from_tag(tag).ok_or_else(|| ParseError::UnknownType(tag.to_string()))?;

        if kind == MessageType::Metadata {
            return self.decode_metadata_part(body);
        }
        let properties = parse_pairs(body)?;
        Ok(Some(Message::new(kind, properties, line)))
    }

    fn reset(&mut self) {
        self.partial = None;
    }
}

fn parse_part_number(field: Option<&str>, body: &str) -> Result<u8, ParseError> {
    field
        .and_then(|s| s.trim().parse::<u8>().ok())
        .ok_or_else(|| ParseError::Malformed(format!("M:{}", body)))
}

fn parse_pairs(body: &str) -> Result<Vec<(String, String)>, ParseError> {
    body.split(',')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| ParseError::Malformed(segment.to_string()))
        })
        .collect()
}

/// Stream framer: extract one LF-terminated line if present, without the
/// terminator (a CR before the LF is stripped as well).
pub fn try_extract_line(buffer: &mut BytesMut) -> Option<Bytes> {
    let pos = memchr::memchr(LF, buffer.as_ref())?;
    let mut line = buffer.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(pos - 1);
    }
    Some(line.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ThermostatMode;

    #[test]
    fn decodes_hello_properties_in_order() {
        let mut codec = TextCodec::new();
        let msg = codec
            .decode("H:serial=KEQ0523864,rf=097f2c,firmware=0113,duty=0,slots=50\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind(), MessageType::Hello);
        assert_eq!(msg.get("serial"), Some("KEQ0523864"));
        assert_eq!(msg.properties()[1], ("rf".to_string(), "097f2c".to_string()));
        assert_eq!(msg.raw(), "H:serial=KEQ0523864,rf=097f2c,firmware=0113,duty=0,slots=50");
    }

    #[test]
    fn empty_device_list_is_a_message() {
        let mut codec = TextCodec::new();
        let msg = codec.decode("L:").unwrap().unwrap();
        assert_eq!(msg.kind(), MessageType::DeviceList);
        assert!(msg.properties().is_empty());
    }

    #[test]
    fn unknown_tag_and_missing_separator_are_errors() {
        let mut codec = TextCodec::new();
        assert_eq!(codec.decode("Z:foo=1"), Err(ParseError::UnknownType("Z".into())));
        assert!(matches!(codec.decode("garbage"), Err(ParseError::Malformed(_))));
        assert!(matches!(codec.decode("H:serial"), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn metadata_parts_are_accumulated() {
        let mut codec = TextCodec::new();
        assert_eq!(codec.decode("M:00,02,room_id=1,room_name=Living").unwrap(), None);
        let msg = codec
            .decode("M:01,02,serial=KEQ1,rf=0a1b2c,type=thermostat,name=Window,room=1")
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind(), MessageType::Metadata);
        assert_eq!(msg.get("room_name"), Some("Living"));
        assert_eq!(msg.get("serial"), Some("KEQ1"));
    }

    #[test]
    fn out_of_sequence_part_is_rejected_and_reset_recovers() {
        let mut codec = TextCodec::new();
        assert_eq!(codec.decode("M:00,03,room_id=1,room_name=A").unwrap(), None);
        assert_eq!(
            codec.decode("M:02,03,room_id=2,room_name=B"),
            Err(ParseError::OutOfSequence { expected: 1, got: 2 })
        );
        codec.reset();
        let msg = codec.decode("M:00,01,room_id=3,room_name=C").unwrap().unwrap();
        assert_eq!(msg.records(&["room_id"]).len(), 1);
    }

    #[test]
    fn records_split_on_start_keys() {
        let mut codec = TextCodec::new();
        let msg = codec
            .decode("L:rf=0a1b2c,mode=AUTOMATIC,valve=20,rf=0d0e0f,open=1")
            .unwrap()
            .unwrap();
        let records = msg.records(&["rf"]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], vec![("rf", "0a1b2c"), ("mode", "AUTOMATIC"), ("valve", "20")]);
        assert_eq!(records[1], vec![("rf", "0d0e0f"), ("open", "1")]);
    }

    #[test]
    fn encodes_commands() {
        let codec = TextCodec::new();
        assert_eq!(codec.encode(&CubeCommand::ListDevices), Bytes::from_static(b"l:\r\n"));
        let set = CubeCommand::SetPoint {
            rf_address: "0a1b2c".into(),
            room_id: 1,
            mode: ThermostatMode::Manual,
            temperature: 21.5,
        };
        assert_eq!(codec.encode(&set), Bytes::from_static(b"s:0a1b2c,1,MANUAL,21.5\r\n"));
        let ntp = CubeCommand::Ntp { servers: vec!["ntp.homematic.com".into(), "pool.ntp.org".into()] };
        assert_eq!(codec.encode(&ntp), Bytes::from_static(b"f:ntp.homematic.com,pool.ntp.org\r\n"));
        assert_eq!(
            codec.encode(&CubeCommand::DeleteDevice { rf_address: "0a1b2c".into(), force: true }),
            Bytes::from_static(b"t:0a1b2c,1\r\n")
        );
    }

    #[test]
    fn extract_line_waits_for_terminator() {
        let mut buf = BytesMut::from(&b"H:duty=0\r\nL:rf="[..]);
        assert_eq!(try_extract_line(&mut buf), Some(Bytes::from_static(b"H:duty=0")));
        assert_eq!(try_extract_line(&mut buf), None);
        buf.extend_from_slice(b"0a\n");
        assert_eq!(try_extract_line(&mut buf), Some(Bytes::from_static(b"L:rf=0a")));
        assert!(buf.is_empty());
    }
}
