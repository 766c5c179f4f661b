//! pgoutput decoder
//!
//! Decodes binary pgoutput messages (proto_version 1) into typed bodies.

use super::message::*;
use crate::common::{BackupError, Lsn, NamespacedName, Oid};
use bytes::{Buf, Bytes};
use thiserror::Error;

/// Decoder errors
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("invalid message type: {0}")]
    InvalidType(u8),
    #[error("UTF8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<DecodeError> for BackupError {
    fn from(e: DecodeError) -> Self {
        BackupError::Protocol(e.to_string())
    }
}

/// pgoutput decoder
pub struct PgOutputDecoder;

impl PgOutputDecoder {
    /// Decode one pgoutput message.
    pub fn decode(data: &mut Bytes) -> Result<PgOutputMessage, DecodeError> {
        if !data.has_remaining() {
            return Err(DecodeError::NotEnoughData);
        }

        let msg_type = data.get_u8();

        match msg_type {
            b'B' => Self::decode_begin(data).map(PgOutputMessage::Begin),
            b'C' => Self::decode_commit(data).map(PgOutputMessage::Commit),
            b'O' => Self::decode_origin(data).map(PgOutputMessage::Origin),
            b'R' => Self::decode_relation(data).map(PgOutputMessage::Relation),
            b'Y' => Self::decode_type(data).map(PgOutputMessage::Type),
            b'I' => Self::decode_insert(data).map(PgOutputMessage::Insert),
            b'U' => Self::decode_update(data).map(PgOutputMessage::Update),
            b'D' => Self::decode_delete(data).map(PgOutputMessage::Delete),
            b'T' => Self::decode_truncate(data).map(PgOutputMessage::Truncate),
            t => Err(DecodeError::InvalidType(t)),
        }
    }

    fn decode_begin(buf: &mut Bytes) -> Result<BeginBody, DecodeError> {
        ensure_remaining(buf, 20)?;
        let final_lsn = Lsn(buf.get_u64());
        let timestamp = buf.get_i64();
        let xid = buf.get_u32();
        Ok(BeginBody {
            final_lsn,
            timestamp,
            xid,
        })
    }

    fn decode_commit(buf: &mut Bytes) -> Result<CommitBody, DecodeError> {
        ensure_remaining(buf, 25)?;
        let flags = buf.get_u8();
        let commit_lsn = Lsn(buf.get_u64());
        let end_lsn = Lsn(buf.get_u64());
        let timestamp = buf.get_i64();
        Ok(CommitBody {
            flags,
            commit_lsn,
            end_lsn,
            timestamp,
        })
    }

    fn decode_origin(buf: &mut Bytes) -> Result<OriginBody, DecodeError> {
        ensure_remaining(buf, 8)?;
        let commit_lsn = Lsn(buf.get_u64());
        let name = read_string(buf)?;
        Ok(OriginBody { commit_lsn, name })
    }

    fn decode_relation(buf: &mut Bytes) -> Result<RelationBody, DecodeError> {
        ensure_remaining(buf, 4)?;
        let oid = Oid(buf.get_u32());
        let namespace = read_string(buf)?;
        let name = read_string(buf)?;
        ensure_remaining(buf, 3)?;
        let replica_identity = buf.get_u8();
        let num_columns = buf.get_u16();

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            ensure_remaining(buf, 1)?;
            let flags = buf.get_u8();
            let col_name = read_string(buf)?;
            ensure_remaining(buf, 8)?;
            let type_oid = buf.get_i32();
            let type_mod = buf.get_i32();
            columns.push(Column {
                flags,
                name: col_name,
                type_oid,
                type_mod,
            });
        }

        Ok(RelationBody {
            oid,
            name: NamespacedName::new(namespace, name),
            replica_identity,
            columns,
        })
    }

    fn decode_type(buf: &mut Bytes) -> Result<TypeBody, DecodeError> {
        ensure_remaining(buf, 4)?;
        let oid = buf.get_u32();
        let namespace = read_string(buf)?;
        let name = read_string(buf)?;
        Ok(TypeBody {
            oid,
            namespace,
            name,
        })
    }

    fn decode_insert(buf: &mut Bytes) -> Result<InsertBody, DecodeError> {
        ensure_remaining(buf, 5)?;
        let oid = Oid(buf.get_u32());
        let char_n = buf.get_u8();
        if char_n != b'N' {
            return Err(DecodeError::Protocol("expected N for new tuple".into()));
        }
        let new_tuple = decode_tuple(buf)?;
        Ok(InsertBody { oid, new_tuple })
    }

    fn decode_update(buf: &mut Bytes) -> Result<UpdateBody, DecodeError> {
        ensure_remaining(buf, 5)?;
        let oid = Oid(buf.get_u32());
        let tag = buf.get_u8();

        let (key_tuple, new_tuple) = match tag {
            b'K' | b'O' => {
                let key = Some(decode_tuple(buf)?);
                ensure_remaining(buf, 1)?;
                let char_n = buf.get_u8();
                if char_n != b'N' {
                    return Err(DecodeError::Protocol(format!(
                        "expected N after {}",
                        tag as char
                    )));
                }
                (key, decode_tuple(buf)?)
            }
            b'N' => (None, decode_tuple(buf)?),
            t => return Err(DecodeError::InvalidType(t)),
        };

        Ok(UpdateBody {
            oid,
            key_tuple,
            new_tuple,
        })
    }

    fn decode_delete(buf: &mut Bytes) -> Result<DeleteBody, DecodeError> {
        ensure_remaining(buf, 5)?;
        let oid = Oid(buf.get_u32());
        let tag = buf.get_u8();

        let key_tuple = match tag {
            b'K' | b'O' => Some(decode_tuple(buf)?),
            t => return Err(DecodeError::InvalidType(t)),
        };

        Ok(DeleteBody { oid, key_tuple })
    }

    fn decode_truncate(buf: &mut Bytes) -> Result<TruncateBody, DecodeError> {
        ensure_remaining(buf, 5)?;
        let num_rels = buf.get_u32();
        let options = buf.get_u8();
        ensure_remaining(buf, num_rels as usize * 4)?;
        let mut oids = Vec::with_capacity(num_rels as usize);
        for _ in 0..num_rels {
            oids.push(Oid(buf.get_u32()));
        }
        Ok(TruncateBody { oids, options })
    }
}

fn ensure_remaining(buf: &Bytes, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::NotEnoughData);
    }
    Ok(())
}

fn read_string(buf: &mut Bytes) -> Result<String, DecodeError> {
    if !buf.has_remaining() {
        return Err(DecodeError::NotEnoughData);
    }
    let n = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::NotEnoughData)?;
    let s_bytes = buf.copy_to_bytes(n);
    buf.advance(1); // skip null
    Ok(std::str::from_utf8(&s_bytes)?.to_string())
}

fn decode_tuple(buf: &mut Bytes) -> Result<Tuple, DecodeError> {
    ensure_remaining(buf, 2)?;
    let num_cols = buf.get_u16();
    let mut columns = Vec::with_capacity(num_cols as usize);

    for _ in 0..num_cols {
        ensure_remaining(buf, 1)?;
        let type_code = buf.get_u8();
        let data = match type_code {
            b'n' => TupleData::Null,
            b'u' => TupleData::Toast,
            b't' => {
                ensure_remaining(buf, 4)?;
                let len = buf.get_u32() as usize;
                ensure_remaining(buf, len)?;
                TupleData::Text(buf.copy_to_bytes(len))
            }
            t => return Err(DecodeError::InvalidType(t)),
        };
        columns.push(data);
    }

    Ok(Tuple(columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn put_cstr(buf: &mut BytesMut, s: &str) {
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
    }

    #[test]
    fn decode_begin() {
        let mut data = BytesMut::new();
        data.put_u8(b'B');
        data.put_u64(0x100);
        data.put_i64(1_705_000_000_000_000);
        data.put_u32(731);

        let mut bytes = data.freeze();
        match PgOutputDecoder::decode(&mut bytes).unwrap() {
            PgOutputMessage::Begin(body) => {
                assert_eq!(body.final_lsn, Lsn(0x100));
                assert_eq!(body.xid, 731);
            }
            other => panic!("expected Begin, got {other:?}"),
        }
    }

    #[test]
    fn decode_commit() {
        let mut data = BytesMut::new();
        data.put_u8(b'C');
        data.put_u8(0);
        data.put_u64(0x100);
        data.put_u64(0x108);
        data.put_i64(42);

        let mut bytes = data.freeze();
        match PgOutputDecoder::decode(&mut bytes).unwrap() {
            PgOutputMessage::Commit(body) => {
                assert_eq!(body.commit_lsn, Lsn(0x100));
                assert_eq!(body.end_lsn, Lsn(0x108));
                assert_eq!(body.timestamp, 42);
            }
            other => panic!("expected Commit, got {other:?}"),
        }
    }

    #[test]
    fn decode_relation() {
        let mut data = BytesMut::new();
        data.put_u8(b'R');
        data.put_u32(16384);
        put_cstr(&mut data, "public");
        put_cstr(&mut data, "users");
        data.put_u8(b'd');
        data.put_u16(2);
        // column id
        data.put_u8(1);
        put_cstr(&mut data, "id");
        data.put_i32(23);
        data.put_i32(-1);
        // column name
        data.put_u8(0);
        put_cstr(&mut data, "name");
        data.put_i32(25);
        data.put_i32(-1);

        let mut bytes = data.freeze();
        match PgOutputDecoder::decode(&mut bytes).unwrap() {
            PgOutputMessage::Relation(rel) => {
                assert_eq!(rel.oid, Oid(16384));
                assert_eq!(rel.name.to_string(), "public.users");
                assert_eq!(rel.replica_identity, b'd');
                assert_eq!(rel.columns.len(), 2);
                assert_eq!(rel.columns[0].name, "id");
                assert_eq!(rel.columns[0].type_oid, 23);
                assert_eq!(rel.columns[1].name, "name");
            }
            other => panic!("expected Relation, got {other:?}"),
        }
    }

    #[test]
    fn decode_insert_with_tuple() {
        let mut data = BytesMut::new();
        data.put_u8(b'I');
        data.put_u32(16384);
        data.put_u8(b'N');
        data.put_u16(3);
        data.put_u8(b't');
        data.put_u32(2);
        data.put_slice(b"42");
        data.put_u8(b'n');
        data.put_u8(b'u');

        let mut bytes = data.freeze();
        match PgOutputDecoder::decode(&mut bytes).unwrap() {
            PgOutputMessage::Insert(ins) => {
                assert_eq!(ins.oid, Oid(16384));
                assert_eq!(ins.new_tuple.0.len(), 3);
                assert!(matches!(&ins.new_tuple.0[0], TupleData::Text(b) if &b[..] == b"42"));
                assert!(matches!(ins.new_tuple.0[1], TupleData::Null));
                assert!(matches!(ins.new_tuple.0[2], TupleData::Toast));
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[test]
    fn decode_update_with_key_tuple() {
        let mut data = BytesMut::new();
        data.put_u8(b'U');
        data.put_u32(16384);
        data.put_u8(b'K');
        data.put_u16(1);
        data.put_u8(b't');
        data.put_u32(1);
        data.put_slice(b"1");
        data.put_u8(b'N');
        data.put_u16(1);
        data.put_u8(b't');
        data.put_u32(1);
        data.put_slice(b"2");

        let mut bytes = data.freeze();
        match PgOutputDecoder::decode(&mut bytes).unwrap() {
            PgOutputMessage::Update(upd) => {
                assert!(upd.key_tuple.is_some());
                assert_eq!(upd.new_tuple.0.len(), 1);
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn decode_delete() {
        let mut data = BytesMut::new();
        data.put_u8(b'D');
        data.put_u32(16384);
        data.put_u8(b'O');
        data.put_u16(1);
        data.put_u8(b'n');

        let mut bytes = data.freeze();
        match PgOutputDecoder::decode(&mut bytes).unwrap() {
            PgOutputMessage::Delete(del) => {
                assert_eq!(del.oid, Oid(16384));
                assert!(del.key_tuple.is_some());
            }
            other => panic!("expected Delete, got {other:?}"),
        }
    }

    #[test]
    fn decode_truncate() {
        let mut data = BytesMut::new();
        data.put_u8(b'T');
        data.put_u32(2);
        data.put_u8(0);
        data.put_u32(16384);
        data.put_u32(16385);

        let mut bytes = data.freeze();
        match PgOutputDecoder::decode(&mut bytes).unwrap() {
            PgOutputMessage::Truncate(tr) => {
                assert_eq!(tr.oids, vec![Oid(16384), Oid(16385)]);
            }
            other => panic!("expected Truncate, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = Bytes::from_static(&[b'Z', 0, 0]);
        assert!(matches!(
            PgOutputDecoder::decode(&mut bytes),
            Err(DecodeError::InvalidType(b'Z'))
        ));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let mut bytes = Bytes::from_static(&[b'B', 0, 0, 1]);
        assert!(matches!(
            PgOutputDecoder::decode(&mut bytes),
            Err(DecodeError::NotEnoughData)
        ));
        let mut empty = Bytes::new();
        assert!(PgOutputDecoder::decode(&mut empty).is_err());
    }
}
