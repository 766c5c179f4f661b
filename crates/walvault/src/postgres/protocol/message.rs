//! pgoutput protocol messages
//!
//! Typed bodies for the messages a proto_version-1 pgoutput stream can
//! deliver. The engine archives the raw payload bytes; these types exist
//! so dispatch can branch on structure without re-parsing.

use crate::common::{Lsn, NamespacedName, Oid};
use bytes::Bytes;

/// A decoded pgoutput message.
#[derive(Debug, Clone)]
pub enum PgOutputMessage {
    Begin(BeginBody),
    Commit(CommitBody),
    Origin(OriginBody),
    Relation(RelationBody),
    Type(TypeBody),
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate(TruncateBody),
}

/// BEGIN: opens a transaction; `final_lsn` is where its commit will land.
#[derive(Debug, Clone)]
pub struct BeginBody {
    pub final_lsn: Lsn,
    pub timestamp: i64,
    pub xid: u32,
}

/// COMMIT: closes the current transaction.
#[derive(Debug, Clone)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub timestamp: i64,
}

/// ORIGIN: replication origin of the following rows.
#[derive(Debug, Clone)]
pub struct OriginBody {
    pub commit_lsn: Lsn,
    pub name: String,
}

/// RELATION: table shape; precedes the first DML touching the table.
#[derive(Debug, Clone)]
pub struct RelationBody {
    pub oid: Oid,
    pub name: NamespacedName,
    pub replica_identity: u8,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub flags: u8,
    pub name: String,
    pub type_oid: i32,
    pub type_mod: i32,
}

/// TYPE: a non-builtin type referenced by a following relation.
#[derive(Debug, Clone)]
pub struct TypeBody {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct InsertBody {
    pub oid: Oid,
    pub new_tuple: Tuple,
}

#[derive(Debug, Clone)]
pub struct UpdateBody {
    pub oid: Oid,
    pub key_tuple: Option<Tuple>,
    pub new_tuple: Tuple,
}

#[derive(Debug, Clone)]
pub struct DeleteBody {
    pub oid: Oid,
    pub key_tuple: Option<Tuple>,
}

#[derive(Debug, Clone)]
pub struct TruncateBody {
    pub oids: Vec<Oid>,
    pub options: u8,
}

/// One row image.
#[derive(Debug, Clone)]
pub struct Tuple(pub Vec<TupleData>);

/// One column within a row image.
#[derive(Debug, Clone)]
pub enum TupleData {
    Null,
    /// Unchanged TOASTed value.
    Toast,
    /// Text representation.
    Text(Bytes),
}
