//! PostgreSQL replication client
//!
//! Minimal TCP client for the streaming replication protocol: startup with
//! `replication=database`, cleartext/MD5 authentication, slot creation and
//! pgoutput streaming in CopyBoth mode.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::common::{BackupError, Lsn, Result};
use crate::config::DbConfig;

/// SQLSTATE for "object already exists"; raised when another consumer won
/// the slot-creation race.
const SQLSTATE_DUPLICATE_OBJECT: &str = "42710";

/// A connection in replication mode, before streaming starts.
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
}

impl ReplicationClient {
    /// Connect and authenticate in replication mode.
    pub async fn connect(db: &DbConfig) -> Result<Self> {
        info!(host = %db.host, port = db.port, user = %db.user, "connecting for replication");
        let stream = TcpStream::connect((db.host.as_str(), db.port)).await?;
        let mut stream = BufReader::new(stream);

        let params = vec![
            ("user", db.user.as_str()),
            ("database", db.dbname.as_str()),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.into_iter(), &mut buf)
            .map_err(|e| BackupError::replication(format!("startup message: {e}")))?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        // Authentication exchange.
        loop {
            let (type_code, body) = read_message(&mut stream).await?;

            let mut raw_msg = BytesMut::with_capacity(1 + 4 + body.len());
            raw_msg.put_u8(type_code);
            raw_msg.put_i32((body.len() + 4) as i32);
            raw_msg.put_slice(&body);

            let msg = backend::Message::parse(&mut raw_msg)
                .map_err(|e| BackupError::replication(format!("auth message: {e}")))?
                .ok_or_else(|| BackupError::replication("short auth message"))?;

            match msg {
                backend::Message::AuthenticationOk => {
                    debug!("authentication successful");
                    break;
                }
                backend::Message::AuthenticationCleartextPassword => {
                    let pass = db
                        .password
                        .as_deref()
                        .ok_or_else(|| BackupError::config("password required but not set"))?;
                    let mut buf = BytesMut::new();
                    frontend::password_message(pass.as_bytes(), &mut buf)
                        .map_err(|e| BackupError::replication(format!("password message: {e}")))?;
                    stream.write_all(&buf).await?;
                    stream.flush().await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let pass = db
                        .password
                        .as_deref()
                        .ok_or_else(|| BackupError::config("password required but not set"))?;
                    let hash = hash_md5_password(&db.user, pass, &body.salt());
                    let mut buf = BytesMut::new();
                    frontend::password_message(hash.as_bytes(), &mut buf)
                        .map_err(|e| BackupError::replication(format!("password message: {e}")))?;
                    stream.write_all(&buf).await?;
                    stream.flush().await?;
                }
                backend::Message::AuthenticationSasl(_) => {
                    return Err(BackupError::replication(
                        "SASL authentication is not supported on the replication connection",
                    ));
                }
                backend::Message::ErrorResponse(_) => {
                    let err = parse_error_body(&body);
                    return Err(BackupError::replication(format!(
                        "authentication failed: {}",
                        err.message
                    )));
                }
                _ => {
                    return Err(BackupError::replication(format!(
                        "unexpected message during auth: {type_code}"
                    )))
                }
            }
        }

        // Drain parameter statuses until ReadyForQuery.
        loop {
            let (type_code, body) = read_message(&mut stream).await?;
            match type_code {
                b'Z' => break,
                b'E' => {
                    let err = parse_error_body(&body);
                    return Err(BackupError::replication(format!(
                        "error waiting for ready: {}",
                        err.message
                    )));
                }
                _ => {}
            }
        }

        Ok(Self { stream })
    }

    /// Create a logical slot with the pgoutput plugin.
    ///
    /// Returns the slot's consistent point, the LSN of the first record the
    /// slot will deliver. A duplicate-object error surfaces as
    /// `BackupError::SlotExists` so the caller can adopt the existing slot.
    pub async fn create_slot(&mut self, slot_name: &str) -> Result<Lsn> {
        let query = format!("CREATE_REPLICATION_SLOT {slot_name} LOGICAL pgoutput");
        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)
            .map_err(|e| BackupError::replication(format!("query message: {e}")))?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        let mut consistent_point: Option<Lsn> = None;
        loop {
            let (type_code, body) = read_message(&mut self.stream).await?;
            match type_code {
                // RowDescription; the shape is fixed, nothing to learn.
                b'T' => {}
                b'D' => {
                    // slot_name, consistent_point, snapshot_name, output_plugin
                    let columns = parse_data_row(&body)?;
                    let text = columns
                        .get(1)
                        .and_then(|c| c.as_deref())
                        .ok_or_else(|| BackupError::replication("missing consistent point"))?;
                    let text = std::str::from_utf8(text)
                        .map_err(|e| BackupError::replication(format!("consistent point: {e}")))?;
                    consistent_point = Some(text.parse::<Lsn>().map_err(|e| {
                        BackupError::replication(format!("consistent point: {e}"))
                    })?);
                }
                b'C' => {}
                b'Z' => break,
                b'E' => {
                    let err = parse_error_body(&body);
                    if err.code.as_deref() == Some(SQLSTATE_DUPLICATE_OBJECT) {
                        // Another consumer created it first; recover before
                        // the caller reuses this connection.
                        self.wait_ready().await?;
                        return Err(BackupError::SlotExists(slot_name.to_string()));
                    }
                    return Err(BackupError::replication(format!(
                        "could not create replication slot: {}",
                        err.message
                    )));
                }
                _ => {}
            }
        }

        consistent_point
            .ok_or_else(|| BackupError::replication("slot creation returned no consistent point"))
    }

    /// Start streaming from `start_lsn` and hand over the CopyBoth stream.
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        start_lsn: Lsn,
        publication: &str,
    ) -> Result<ReplicationStream> {
        let query = format!(
            "START_REPLICATION SLOT {slot_name} LOGICAL {start_lsn} (\"proto_version\" '1', \"publication_names\" '{publication}')"
        );
        info!(%start_lsn, slot = slot_name, "starting replication");

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)
            .map_err(|e| BackupError::replication(format!("query message: {e}")))?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        let (type_code, body) = read_message(&mut self.stream).await?;
        match type_code {
            b'W' => {
                debug!("entered CopyBoth mode");
                Ok(ReplicationStream {
                    stream: self.stream,
                })
            }
            b'E' => {
                let err = parse_error_body(&body);
                Err(BackupError::replication(format!(
                    "could not start replication: {}",
                    err.message
                )))
            }
            t => Err(BackupError::replication(format!(
                "unexpected response to START_REPLICATION: {}",
                t as char
            ))),
        }
    }

    async fn wait_ready(&mut self) -> Result<()> {
        loop {
            let (type_code, _) = read_message(&mut self.stream).await?;
            if type_code == b'Z' {
                return Ok(());
            }
        }
    }
}

/// One frame received in CopyBoth mode.
#[derive(Debug, Clone)]
pub enum ReplicationFrame {
    /// Decoded WAL payload.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        timestamp: i64,
        data: Bytes,
    },
    /// Server heartbeat.
    Keepalive { wal_end: Lsn, reply_requested: bool },
}

/// The CopyBoth stream carrying WAL frames.
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
}

impl ReplicationStream {
    /// Await the next replication frame.
    ///
    /// Returns `Ok(None)` when the server ends the copy stream.
    pub async fn next_frame(&mut self) -> Result<Option<ReplicationFrame>> {
        let (type_code, body) = read_message(&mut self.stream).await?;

        match type_code {
            b'd' => Self::parse_copy_data(Bytes::from(body)).map(Some),
            b'c' => Ok(None), // CopyDone
            b'E' => {
                let err = parse_error_body(&body);
                Err(BackupError::replication(format!(
                    "replication stream error: {}",
                    err.message
                )))
            }
            t => Err(BackupError::replication(format!(
                "unexpected message type on replication stream: {}",
                t as char
            ))),
        }
    }

    fn parse_copy_data(mut body: Bytes) -> Result<ReplicationFrame> {
        if !body.has_remaining() {
            return Err(BackupError::protocol("empty CopyData payload"));
        }
        match body.get_u8() {
            b'w' => {
                if body.remaining() < 24 {
                    return Err(BackupError::protocol("short XLogData header"));
                }
                let wal_start = Lsn(body.get_u64());
                let wal_end = Lsn(body.get_u64());
                let timestamp = body.get_i64();
                Ok(ReplicationFrame::XLogData {
                    wal_start,
                    wal_end,
                    timestamp,
                    data: body,
                })
            }
            b'k' => {
                if body.remaining() < 17 {
                    return Err(BackupError::protocol("short keepalive"));
                }
                let wal_end = Lsn(body.get_u64());
                let _timestamp = body.get_i64();
                let reply_requested = body.get_u8() == 1;
                Ok(ReplicationFrame::Keepalive {
                    wal_end,
                    reply_requested,
                })
            }
            t => Err(BackupError::protocol(format!(
                "unknown CopyData tag: {}",
                t as char
            ))),
        }
    }

    /// Send a standby status update carrying the durably flushed LSN.
    pub async fn send_status(&mut self, flush_lsn: Lsn) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(flush_lsn.as_u64());
        payload.put_u64(flush_lsn.as_u64());
        payload.put_u64(flush_lsn.as_u64());
        payload.put_i64(pg_epoch_micros());
        payload.put_u8(0);

        let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

async fn read_message(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let type_code = stream.read_u8().await?;
    let len = stream.read_i32().await? as usize;
    if len < 4 {
        return Err(BackupError::replication(format!(
            "invalid message length {len}"
        )));
    }
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await?;
    Ok((type_code, body))
}

struct ServerError {
    code: Option<String>,
    message: String,
}

/// Pull the SQLSTATE and message out of an ErrorResponse body.
fn parse_error_body(body: &[u8]) -> ServerError {
    let mut code = None;
    let mut message = None;
    let mut rest = body;
    while let Some((&field, tail)) = rest.split_first() {
        if field == 0 {
            break;
        }
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        let value = String::from_utf8_lossy(&tail[..end]).into_owned();
        match field {
            b'C' => code = Some(value),
            b'M' => message = Some(value),
            _ => {}
        }
        rest = &tail[(end + 1).min(tail.len())..];
    }
    ServerError {
        code,
        message: message.unwrap_or_else(|| "unknown server error".to_string()),
    }
}

/// Parse a DataRow body into optional column values.
fn parse_data_row(body: &[u8]) -> Result<Vec<Option<Vec<u8>>>> {
    let mut buf = body;
    if buf.remaining() < 2 {
        return Err(BackupError::replication("short DataRow"));
    }
    let ncols = buf.get_i16();
    let mut columns = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        if buf.remaining() < 4 {
            return Err(BackupError::replication("short DataRow"));
        }
        let len = buf.get_i32();
        if len < 0 {
            columns.push(None);
        } else {
            let len = len as usize;
            if buf.remaining() < len {
                return Err(BackupError::replication("short DataRow"));
            }
            let mut value = vec![0u8; len];
            buf.copy_to_slice(&mut value);
            columns.push(Some(value));
        }
    }
    Ok(columns)
}

fn pg_epoch_micros() -> i64 {
    // Postgres epoch: 2000-01-01 00:00:00 UTC
    let pg_epoch = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(946_684_800);
    std::time::SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn hash_md5_password(user: &str, pass: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(pass);
    hasher.update(user);
    let first = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(first);
    hasher.update(salt);
    let second = hex::encode(hasher.finalize());

    format!("md5{second}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_hash_matches_server_algorithm() {
        // md5(md5(password + user) + salt), hex-encoded, "md5" prefix
        let hash = hash_md5_password("backup", "secret", &[1, 2, 3, 4]);
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 3 + 32);
        // deterministic
        assert_eq!(hash, hash_md5_password("backup", "secret", &[1, 2, 3, 4]));
        assert_ne!(hash, hash_md5_password("backup", "other", &[1, 2, 3, 4]));
    }

    #[test]
    fn error_body_yields_code_and_message() {
        let mut body = Vec::new();
        body.push(b'S');
        body.extend_from_slice(b"ERROR\0");
        body.push(b'C');
        body.extend_from_slice(b"42710\0");
        body.push(b'M');
        body.extend_from_slice(b"replication slot already exists\0");
        body.push(0);

        let err = parse_error_body(&body);
        assert_eq!(err.code.as_deref(), Some("42710"));
        assert!(err.message.contains("already exists"));
    }

    #[test]
    fn data_row_parsing_handles_nulls() {
        let mut body = Vec::new();
        body.extend_from_slice(&3i16.to_be_bytes());
        body.extend_from_slice(&4i32.to_be_bytes());
        body.extend_from_slice(b"slot");
        body.extend_from_slice(&5i32.to_be_bytes());
        body.extend_from_slice(b"0/100");
        body.extend_from_slice(&(-1i32).to_be_bytes());

        let cols = parse_data_row(&body).unwrap();
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[0].as_deref(), Some(&b"slot"[..]));
        assert_eq!(cols[1].as_deref(), Some(&b"0/100"[..]));
        assert!(cols[2].is_none());
    }

    #[test]
    fn xlogdata_frame_parses() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'w');
        payload.put_u64(0x100);
        payload.put_u64(0x140);
        payload.put_i64(7);
        payload.put_slice(b"BODY");

        match ReplicationStream::parse_copy_data(payload.freeze()).unwrap() {
            ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                timestamp,
                data,
            } => {
                assert_eq!(wal_start, Lsn(0x100));
                assert_eq!(wal_end, Lsn(0x140));
                assert_eq!(timestamp, 7);
                assert_eq!(&data[..], b"BODY");
            }
            other => panic!("expected XLogData, got {other:?}"),
        }
    }

    #[test]
    fn keepalive_frame_parses() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'k');
        payload.put_u64(0x200);
        payload.put_i64(0);
        payload.put_u8(1);

        match ReplicationStream::parse_copy_data(payload.freeze()).unwrap() {
            ReplicationFrame::Keepalive {
                wal_end,
                reply_requested,
            } => {
                assert_eq!(wal_end, Lsn(0x200));
                assert!(reply_requested);
            }
            other => panic!("expected Keepalive, got {other:?}"),
        }
    }

    #[test]
    fn unknown_copy_tag_is_an_error() {
        let payload = Bytes::from_static(&[b'x', 0, 0]);
        assert!(ReplicationStream::parse_copy_data(payload).is_err());
    }
}
