//! MySQL wire protocol observer: `COM_QUERY`/`COM_PING` command packets for
//! query extraction, OK/ERR packets for completion (§4.8). Packet framing:
//! 3-byte little-endian length, 1-byte sequence id, then payload.

use crate::protocol::Completion;

const MYSQL_HEADER_SIZE: usize = 4;
const COM_QUERY: u8 = 0x03;
const COM_PING: u8 = 0x0e;
const OK_MARKER: u8 = 0x00;
const EOF_MARKER: u8 = 0xfe;
const ERR_MARKER: u8 = 0xff;

/// `Some("")` for a bare `COM_PING` (§4.8 "empty `Ping`"), `Some(text)` for
/// `COM_QUERY`, `None` for anything else (handshake, other commands).
pub fn extract_query(frame: &[u8]) -> Option<String> {
    if frame.len() <= MYSQL_HEADER_SIZE {
        return None;
    }
    match frame[MYSQL_HEADER_SIZE] {
        COM_QUERY => Some(String::from_utf8_lossy(&frame[MYSQL_HEADER_SIZE + 1..]).to_string()),
        COM_PING => Some(String::new()),
        _ => None,
    }
}

pub fn extract_completion(frame: &[u8]) -> Option<Completion> {
    if frame.len() <= MYSQL_HEADER_SIZE {
        return None;
    }
    match frame[MYSQL_HEADER_SIZE] {
        OK_MARKER | EOF_MARKER => Some(Completion::Ok(String::new())),
        ERR_MARKER => Some(Completion::Error(error_message(&frame[MYSQL_HEADER_SIZE + 1..]))),
        _ => None,
    }
}

/// ERR packet body: 2-byte LE error code, optional `#` + 5-byte SQLSTATE
/// marker, then the human-readable message.
fn error_message(body: &[u8]) -> String {
    if body.len() < 2 {
        return "mysql error".to_string();
    }
    let code = u16::from_le_bytes([body[0], body[1]]);
    let mut idx = 2;
    if body.len() > idx && body[idx] == b'#' {
        idx = (idx + 6).min(body.len());
    }
    let message = String::from_utf8_lossy(&body[idx..]).to_string();
    format!("{code}: {message}")
}

pub(crate) fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes()[0..3]);
    out.push(seq);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_com_query_text() {
        let mut payload = vec![COM_QUERY];
        payload.extend_from_slice(b"SELECT * FROM users");
        let frame = packet(0, &payload);

        assert_eq!(extract_query(&frame).as_deref(), Some("SELECT * FROM users"));
    }

    #[test]
    fn extracts_com_ping_as_empty_query() {
        let frame = packet(0, &[COM_PING]);
        assert_eq!(extract_query(&frame).as_deref(), Some(""));
    }

    #[test]
    fn ignores_unrecognized_commands() {
        let frame = packet(0, &[0x16]);
        assert_eq!(extract_query(&frame), None);
    }

    #[test]
    fn ok_packet_is_a_successful_completion() {
        let frame = packet(1, &[OK_MARKER, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(extract_completion(&frame), Some(Completion::Ok(String::new())));
    }

    #[test]
    fn err_packet_carries_code_and_message() {
        let mut payload = vec![ERR_MARKER];
        payload.extend_from_slice(&1064u16.to_le_bytes());
        payload.push(b'#');
        payload.extend_from_slice(b"42000");
        payload.extend_from_slice(b"syntax error");
        let frame = packet(1, &payload);

        assert_eq!(extract_completion(&frame), Some(Completion::Error("1064: syntax error".to_string())));
    }
}
