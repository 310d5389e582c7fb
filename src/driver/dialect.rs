//! Dialect-specific query text
//!
//! Each supported engine exposes the same four queries: the topology query
//! returning (node id, is-writer, cpu, replica lag, last update timestamp),
//! a "who am I" node-id query, a "who is the writer, answered only by the
//! writer" query, and a read-only check.

/// Query text for one database engine.
pub trait Dialect: Send + Sync {
    /// Returns rows decoded into [`crate::driver::TopologyRow`].
    fn topology_query(&self) -> &str;

    /// Returns the identifier of the node the connection is attached to.
    fn node_id_query(&self) -> &str;

    /// Returns the writer's node id when executed on the writer, no rows
    /// when executed on a reader.
    fn writer_id_query(&self) -> &str;

    /// Returns a truthy value on read-only (reader) nodes.
    fn is_reader_query(&self) -> &str;
}

/// Aurora MySQL-compatible dialect.
pub struct AuroraMySqlDialect;

impl Dialect for AuroraMySqlDialect {
    fn topology_query(&self) -> &str {
        "SELECT SERVER_ID, CASE WHEN SESSION_ID = 'MASTER_SESSION_ID' THEN TRUE ELSE FALSE END, \
         CPU, REPLICA_LAG_IN_MILLISECONDS, LAST_UPDATE_TIMESTAMP \
         FROM information_schema.replica_host_status \
         WHERE time_to_sec(timediff(now(), LAST_UPDATE_TIMESTAMP)) <= 300 \
         OR SESSION_ID = 'MASTER_SESSION_ID'"
    }

    fn node_id_query(&self) -> &str {
        "SELECT @@aurora_server_id"
    }

    fn writer_id_query(&self) -> &str {
        "SELECT SERVER_ID FROM information_schema.replica_host_status \
         WHERE SESSION_ID = 'MASTER_SESSION_ID' AND SERVER_ID = @@aurora_server_id"
    }

    fn is_reader_query(&self) -> &str {
        "SELECT @@innodb_read_only"
    }
}

/// Aurora PostgreSQL-compatible dialect.
pub struct AuroraPostgresDialect;

impl Dialect for AuroraPostgresDialect {
    fn topology_query(&self) -> &str {
        "SELECT SERVER_ID, CASE WHEN SESSION_ID OPERATOR(pg_catalog.=) 'MASTER_SESSION_ID' \
         THEN TRUE ELSE FALSE END, \
         CPU, COALESCE(REPLICA_LAG_IN_MSEC, 0), LAST_UPDATE_TIMESTAMP \
         FROM pg_catalog.aurora_replica_status() \
         WHERE EXTRACT(EPOCH FROM(pg_catalog.NOW() OPERATOR(pg_catalog.-) LAST_UPDATE_TIMESTAMP)) \
         OPERATOR(pg_catalog.<=) 300 \
         OR SESSION_ID OPERATOR(pg_catalog.=) 'MASTER_SESSION_ID' \
         OR LAST_UPDATE_TIMESTAMP IS NULL"
    }

    fn node_id_query(&self) -> &str {
        "SELECT pg_catalog.aurora_db_instance_identifier()"
    }

    fn writer_id_query(&self) -> &str {
        "SELECT SERVER_ID FROM pg_catalog.aurora_replica_status() \
         WHERE SESSION_ID OPERATOR(pg_catalog.=) 'MASTER_SESSION_ID' \
         AND SERVER_ID OPERATOR(pg_catalog.=) aurora_db_instance_identifier()"
    }

    fn is_reader_query(&self) -> &str {
        "SELECT pg_catalog.pg_is_in_recovery()"
    }
}
