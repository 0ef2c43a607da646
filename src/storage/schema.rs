//! Database schema definitions

/// SQL to create the metadata table (`next_oid`, `dbid`)
pub const CREATE_METADATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS odb_metadata (
    attr TEXT PRIMARY KEY,
    value
)
"#;

/// SQL to create the sessions table
/// One row per writable open; rows written by it carry its ssid
pub const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS odb_sessions (
    ssid INTEGER PRIMARY KEY AUTOINCREMENT,
    session TEXT NOT NULL,
    next_oid INTEGER NOT NULL
)
"#;

/// SQL to create the shape table
pub const CREATE_OID_LOOKUP_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS oid_lookup (
    oid INTEGER PRIMARY KEY ON CONFLICT REPLACE,
    stg_kind TEXT NOT NULL,
    otype TEXT NOT NULL,
    ssid INTEGER
)
"#;

/// SQL to create the literals table
pub const CREATE_LITERALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS literals (
    oid INTEGER PRIMARY KEY ON CONFLICT REPLACE,
    value,
    value_hash INTEGER,
    value_type TEXT,
    ssid INTEGER
)
"#;

/// SQL to create the weakrefs table
pub const CREATE_WEAKREFS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS weakrefs (
    oid_host INTEGER PRIMARY KEY ON CONFLICT REPLACE,
    oid_ref INTEGER,
    ssid INTEGER
)
"#;

/// SQL to create the edge table
/// Ordered edges have a NULL key and keep insertion order through tidx
pub const CREATE_MAPPINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS mappings (
    tidx INTEGER PRIMARY KEY,
    oid_host INTEGER NOT NULL,
    oid_key INTEGER,
    oid_value INTEGER NOT NULL,
    ssid INTEGER
)
"#;

/// SQL to create the externals table
pub const CREATE_EXTERNALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS externals (
    oid INTEGER PRIMARY KEY ON CONFLICT REPLACE,
    url TEXT NOT NULL,
    ssid INTEGER
)
"#;

/// SQL to create the named roots table
pub const CREATE_EXPORTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS exports (
    urlpath TEXT PRIMARY KEY ON CONFLICT REPLACE,
    oid_ref INTEGER NOT NULL,
    ssid INTEGER
)
"#;

/// SQL to create the per-connection mark set used by the collector
pub const CREATE_GRAPH_MEMBERS_TABLE: &str = r#"
CREATE TEMP TABLE IF NOT EXISTS oid_graph_members (
    oid INTEGER PRIMARY KEY
)
"#;

/// SQL to create indexes
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_literals_hash ON literals(value_hash, value_type)",
    "CREATE INDEX IF NOT EXISTS idx_mappings_host ON mappings(oid_host)",
    "CREATE INDEX IF NOT EXISTS idx_weakrefs_ref ON weakrefs(oid_ref)",
    "CREATE INDEX IF NOT EXISTS idx_exports_ref ON exports(oid_ref)",
];

/// Statements removing rows of oids that are no longer in oid_lookup
pub const DELETE_GARBAGE: &[&str] = &[
    "DELETE FROM literals WHERE oid NOT IN (SELECT oid FROM oid_lookup)",
    "DELETE FROM weakrefs WHERE oid_host NOT IN (SELECT oid FROM oid_lookup)",
    "DELETE FROM mappings WHERE oid_host NOT IN (SELECT oid FROM oid_lookup)",
    "DELETE FROM externals WHERE oid NOT IN (SELECT oid FROM oid_lookup)",
];

/// Get all schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![
        CREATE_METADATA_TABLE,
        CREATE_SESSIONS_TABLE,
        CREATE_OID_LOOKUP_TABLE,
        CREATE_LITERALS_TABLE,
        CREATE_WEAKREFS_TABLE,
        CREATE_MAPPINGS_TABLE,
        CREATE_EXTERNALS_TABLE,
        CREATE_EXPORTS_TABLE,
        CREATE_GRAPH_MEMBERS_TABLE,
    ];
    stmts.extend(CREATE_INDEXES.iter().copied());
    stmts
}
