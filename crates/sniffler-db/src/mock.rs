//! Fabricates a protocol-legal response frame from a db `Mock`'s body
//! (§4.8 "Mocking"). Per the Open Question resolution in `DESIGN.md`,
//! fabrication only covers three shapes — `ok`, `empty_rows`, `error` — the
//! ones both Postgres and MySQL can express without a full row-value
//! encoder. Anything else is `MockIncompatible`, which the caller falls
//! back to live forwarding for.

use serde::Deserialize;
use sniffler_core::model::DbProtocol;
use sniffler_core::Error;

use crate::{mysql, postgres};

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MockPayload {
    Ok,
    EmptyRows,
    Error { message: String },
}

pub fn fabricate(protocol: DbProtocol, mock_body: &str) -> Result<Vec<u8>, Error> {
    let payload: MockPayload = serde_json::from_str(mock_body)
        .map_err(|err| Error::mock_incompatible(format!("db mock body is not a recognized payload: {err}")))?;

    match protocol {
        DbProtocol::Postgres => Ok(fabricate_postgres(&payload)),
        DbProtocol::Mysql => Ok(fabricate_mysql(&payload)),
        other => Err(Error::mock_incompatible(format!("db mocking not supported for protocol {other}"))),
    }
}

fn fabricate_postgres(payload: &MockPayload) -> Vec<u8> {
    let mut out = Vec::new();
    match payload {
        MockPayload::Ok => {
            out.extend(postgres::msg(b'C', &postgres::cstring("OK")));
        }
        MockPayload::EmptyRows => {
            out.extend(postgres::msg(b'T', &0i16.to_be_bytes()));
            out.extend(postgres::msg(b'C', &postgres::cstring("SELECT 0")));
        }
        MockPayload::Error { message } => {
            let mut body = Vec::new();
            body.push(b'S');
            body.extend_from_slice(b"ERROR\0");
            body.push(b'C');
            body.extend_from_slice(b"42000\0");
            body.push(b'M');
            body.extend_from_slice(message.as_bytes());
            body.push(0);
            body.push(0);
            out.extend(postgres::msg(b'E', &body));
        }
    }
    out.extend(postgres::msg(b'Z', &[b'I']));
    out
}

fn fabricate_mysql(payload: &MockPayload) -> Vec<u8> {
    match payload {
        MockPayload::Ok => mysql::packet(1, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]),
        MockPayload::EmptyRows => {
            let mut out = mysql::packet(1, &[0x00]);
            out.extend(mysql::packet(2, &[0xfe, 0x00, 0x00, 0x02, 0x00]));
            out
        }
        MockPayload::Error { message } => {
            let mut body = vec![0xff];
            body.extend_from_slice(&1064u16.to_le_bytes());
            body.push(b'#');
            body.extend_from_slice(b"HY000");
            body.extend_from_slice(message.as_bytes());
            mysql::packet(1, &body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fabricates_postgres_ok_frame() {
        let frame = fabricate(DbProtocol::Postgres, r#"{"kind":"ok"}"#).unwrap();
        assert_eq!(frame[0], b'C');
    }

    #[test]
    fn fabricates_mysql_error_frame() {
        let frame = fabricate(DbProtocol::Mysql, r#"{"kind":"error","message":"nope"}"#).unwrap();
        assert_eq!(frame[4], 0xff);
    }

    #[test]
    fn rejects_unrecognized_payload_shape() {
        let err = fabricate(DbProtocol::Postgres, r#"{"kind":"rows","rows":[[1]]}"#).unwrap_err();
        assert_eq!(err.kind(), "MockIncompatible");
    }

    #[test]
    fn rejects_protocols_without_db_mocking_support() {
        let err = fabricate(DbProtocol::Redis, r#"{"kind":"ok"}"#).unwrap_err();
        assert_eq!(err.kind(), "MockIncompatible");
    }
}
