//! Catalog access over the non-replication control connection.
//!
//! Publication existence, slot bookkeeping, table enumeration and replica
//! identity adjustment all run here; the replication connection never
//! executes SQL.

use crate::common::{BackupError, Lsn, NamespacedName, Oid, Result};
use crate::config::DbConfig;
use tokio_postgres::NoTls;
use tracing::{debug, error, info};

const APPLICATION_NAME: &str = "walvault";

/// Replica identity setting of a table, as stored in `pg_class.relreplident`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default,
    Nothing,
    Full,
    Index,
}

impl ReplicaIdentity {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'd' => Some(ReplicaIdentity::Default),
            'n' => Some(ReplicaIdentity::Nothing),
            'f' => Some(ReplicaIdentity::Full),
            'i' => Some(ReplicaIdentity::Index),
            _ => None,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            ReplicaIdentity::Default => "DEFAULT",
            ReplicaIdentity::Nothing => "NOTHING",
            ReplicaIdentity::Full => "FULL",
            ReplicaIdentity::Index => "USING INDEX",
        }
    }

    /// The identity a backed-up table should carry. Tables with a primary
    /// key stream enough with DEFAULT; everything else needs FULL so that
    /// UPDATE/DELETE records identify the row, unless an INDEX identity is
    /// already in place.
    pub fn target_for(has_pk: bool, current: ReplicaIdentity) -> ReplicaIdentity {
        if has_pk {
            ReplicaIdentity::Default
        } else if current == ReplicaIdentity::Index {
            ReplicaIdentity::Index
        } else {
            ReplicaIdentity::Full
        }
    }
}

impl std::fmt::Display for ReplicaIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

/// One table enumerated from the publication.
#[derive(Debug, Clone)]
pub struct PublicationTable {
    pub oid: Oid,
    pub name: NamespacedName,
    pub has_pk: bool,
    pub replica_identity: ReplicaIdentity,
}

/// The control connection.
pub struct ControlConnection {
    client: tokio_postgres::Client,
}

impl ControlConnection {
    pub async fn connect(db: &DbConfig) -> Result<Self> {
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&db.host)
            .port(db.port)
            .user(&db.user)
            .dbname(&db.dbname)
            .application_name(APPLICATION_NAME);
        if let Some(password) = &db.password {
            cfg.password(password);
        }

        let (client, connection) = cfg.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("control connection error: {e}");
            }
        });

        let row = client.query_one("SELECT pg_backend_pid()", &[]).await?;
        let pid: i32 = row.get(0);
        debug!(pid, "control connection established");

        Ok(Self { client })
    }

    /// Create the publication if it does not exist yet.
    pub async fn ensure_publication(&self, name: &str) -> Result<()> {
        let exists = self
            .client
            .query_opt("SELECT 1 FROM pg_publication WHERE pubname = $1", &[&name])
            .await?
            .is_some();

        if !exists {
            info!(publication = name, "creating missing publication");
            self.client
                .execute(
                    &format!("CREATE PUBLICATION \"{name}\" FOR ALL TABLES"),
                    &[],
                )
                .await?;
        }
        Ok(())
    }

    /// The slot's confirmed flush LSN, or `None` when the slot does not
    /// exist on this database.
    pub async fn slot_flush_lsn(&self, slot_name: &str) -> Result<Option<Lsn>> {
        let row = self
            .client
            .query_opt(
                "SELECT confirmed_flush_lsn::text FROM pg_replication_slots \
                 WHERE slot_name = $1 AND database = current_database()",
                &[&slot_name],
            )
            .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let text: Option<String> = row.get(0);
                match text {
                    // A slot that never confirmed anything reports NULL.
                    None => Ok(Some(Lsn::INVALID)),
                    Some(text) => {
                        let lsn = text.parse::<Lsn>().map_err(|e| {
                            BackupError::replication(format!("confirmed_flush_lsn: {e}"))
                        })?;
                        Ok(Some(lsn))
                    }
                }
            }
        }
    }

    /// Enumerate ordinary tables in the publication together with what we
    /// need to pick their replica identity.
    pub async fn publication_tables(&self, publication: &str) -> Result<Vec<PublicationTable>> {
        let rows = self
            .client
            .query(
                "SELECT c.oid, \
                        n.nspname, \
                        c.relname, \
                        csr.oid IS NOT NULL AS has_pk, \
                        c.relreplident::text AS replica_identity \
                 FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 JOIN pg_publication_tables pub \
                   ON (c.relname = pub.tablename AND n.nspname = pub.schemaname) \
                 LEFT JOIN pg_constraint csr \
                   ON (csr.conrelid = c.oid AND csr.contype = 'p') \
                 WHERE c.relkind = 'r' \
                   AND pub.pubname = $1",
                &[&publication],
            )
            .await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let oid: u32 = row.get(0);
            let namespace: String = row.get(1);
            let name: String = row.get(2);
            let has_pk: bool = row.get(3);
            let ident: String = row.get(4);
            let replica_identity = ident
                .chars()
                .next()
                .and_then(ReplicaIdentity::from_char)
                .ok_or_else(|| {
                    BackupError::replication(format!("unknown replica identity {ident:?}"))
                })?;

            tables.push(PublicationTable {
                oid: Oid(oid),
                name: NamespacedName::new(namespace, name),
                has_pk,
                replica_identity,
            });
        }
        Ok(tables)
    }

    /// Change a table's replica identity. `ONLY` keeps partitions out of it.
    pub async fn set_replica_identity(
        &self,
        table: &NamespacedName,
        target: ReplicaIdentity,
    ) -> Result<()> {
        if target == ReplicaIdentity::Index {
            // An index identity names a specific index; we never install one
            // ourselves, only preserve what is already configured.
            return Ok(());
        }
        info!(table = %table, identity = %target, "setting replica identity");
        self.client
            .execute(
                &format!(
                    "ALTER TABLE ONLY {} REPLICA IDENTITY {}",
                    table.sanitized(),
                    target.as_sql()
                ),
                &[],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_identity_char_mapping() {
        assert_eq!(
            ReplicaIdentity::from_char('d'),
            Some(ReplicaIdentity::Default)
        );
        assert_eq!(ReplicaIdentity::from_char('f'), Some(ReplicaIdentity::Full));
        assert_eq!(
            ReplicaIdentity::from_char('n'),
            Some(ReplicaIdentity::Nothing)
        );
        assert_eq!(
            ReplicaIdentity::from_char('i'),
            Some(ReplicaIdentity::Index)
        );
        assert_eq!(ReplicaIdentity::from_char('x'), None);
    }

    #[test]
    fn target_prefers_pk_then_index_then_full() {
        assert_eq!(
            ReplicaIdentity::target_for(true, ReplicaIdentity::Nothing),
            ReplicaIdentity::Default
        );
        assert_eq!(
            ReplicaIdentity::target_for(false, ReplicaIdentity::Index),
            ReplicaIdentity::Index
        );
        assert_eq!(
            ReplicaIdentity::target_for(false, ReplicaIdentity::Default),
            ReplicaIdentity::Full
        );
        assert_eq!(
            ReplicaIdentity::target_for(false, ReplicaIdentity::Nothing),
            ReplicaIdentity::Full
        );
    }
}
