//! PostgreSQL wire protocol observer: Simple Query (`Q`) and Parse (`P`)
//! messages for query extraction, `CommandComplete`/`ErrorResponse` for
//! completion (§4.8). Frontend/backend message framing per the protocol
//! docs: one type byte followed by a big-endian `i32` length (inclusive of
//! itself) followed by the payload.

use crate::protocol::Completion;

/// `true` if `frame` looks like a Postgres startup packet: a length prefix
/// followed by a recognized protocol-version or negotiation code.
pub fn looks_like_startup(frame: &[u8]) -> bool {
    if frame.len() < 8 {
        return false;
    }
    let code = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
    matches!(code, 196_608 | 80_877_103 | 80_877_104)
}

pub fn extract_query(frame: &[u8]) -> Option<String> {
    if frame.len() < 5 {
        return None;
    }
    match frame[0] {
        b'Q' => {
            let payload = &frame[5..];
            Some(cstring_lossy(payload))
        }
        b'P' => {
            let payload = &frame[5..];
            let mut parts = payload.splitn(3, |&b| b == 0);
            let _statement_name = parts.next()?;
            let query = parts.next()?;
            Some(String::from_utf8_lossy(query).to_string())
        }
        _ => None,
    }
}

pub fn extract_completion(frame: &[u8]) -> Option<Completion> {
    if frame.len() < 5 {
        return None;
    }
    match frame[0] {
        b'C' => Some(Completion::Ok(cstring_lossy(&frame[5..]))),
        b'E' => Some(Completion::Error(error_message(&frame[5..]))),
        _ => None,
    }
}

fn cstring_lossy(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// `ErrorResponse` bodies are a run of `(field_type: u8, value: cstring)`
/// pairs terminated by a zero byte; the `M` field carries the message.
fn error_message(fields: &[u8]) -> String {
    let mut idx = 0;
    let mut message = String::new();
    while idx < fields.len() && fields[idx] != 0 {
        let field_type = fields[idx];
        idx += 1;
        let start = idx;
        while idx < fields.len() && fields[idx] != 0 {
            idx += 1;
        }
        let value = String::from_utf8_lossy(&fields[start..idx]).to_string();
        if idx < fields.len() {
            idx += 1;
        }
        if field_type == b'M' {
            message = value;
        }
    }
    message
}

/// `msg` frames one protocol message: type byte + big-endian length
/// (inclusive of the length field itself) + body.
pub(crate) fn msg(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + body.len());
    out.push(tag);
    out.extend_from_slice(&((4 + body.len()) as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub(crate) fn cstring(value: &str) -> Vec<u8> {
    let mut out = value.as_bytes().to_vec();
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_startup_packet() {
        let mut frame = vec![0u8, 0, 0, 8];
        frame.extend_from_slice(&196_608u32.to_be_bytes());
        assert!(looks_like_startup(&frame));
    }

    #[test]
    fn extracts_simple_query() {
        let mut frame = vec![b'Q'];
        let body = cstring("SELECT 1");
        frame.extend_from_slice(&((4 + body.len()) as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        assert_eq!(extract_query(&frame).as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn extracts_parse_message_query_text() {
        let mut body = Vec::new();
        body.extend_from_slice(&cstring("stmt1"));
        body.extend_from_slice(&cstring("SELECT * FROM users WHERE id = $1"));
        body.extend_from_slice(&0u16.to_be_bytes());

        let mut frame = vec![b'P'];
        frame.extend_from_slice(&((4 + body.len()) as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        assert_eq!(extract_query(&frame).as_deref(), Some("SELECT * FROM users WHERE id = $1"));
    }

    #[test]
    fn extracts_command_complete_tag() {
        let frame = msg(b'C', &cstring("SELECT 1"));
        assert_eq!(extract_completion(&frame), Some(Completion::Ok("SELECT 1".to_string())));
    }

    #[test]
    fn extracts_error_message() {
        let mut body = Vec::new();
        body.push(b'S');
        body.extend_from_slice(b"ERROR\0");
        body.push(b'M');
        body.extend_from_slice(b"relation \"x\" does not exist\0");
        body.push(0);

        let frame = msg(b'E', &body);
        assert_eq!(
            extract_completion(&frame),
            Some(Completion::Error("relation \"x\" does not exist".to_string()))
        );
    }

    #[test]
    fn non_query_frames_are_ignored() {
        let frame = vec![b'X', 0, 0, 0, 4];
        assert_eq!(extract_query(&frame), None);
        assert_eq!(extract_completion(&frame), None);
    }
}
