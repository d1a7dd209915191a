//! Vector table storage.
//!
//! One SQLite table per (embedding model, vault) pair. Column types are
//! declared so the live schema can be read back with `PRAGMA table_info` and
//! compared against the schema the current embedding model implies. Any
//! mismatch means the table is dropped and recreated empty; contents are
//! rebuilt from the notes on disk rather than migrated.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rayon::prelude::*;
use rusqlite::{Connection, Row, params};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::embedder::EmbeddingFunction;
use crate::error::{AppError, AppResult};

const TABLE_PREFIX: &str = "index_table_";

/// Which model and vault every vector table belongs to.
const REGISTRY_TABLE: &str = "vector_table_registry";

/// Characters that may not appear in a table identity.
const UNSAFE_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Column order used by every full-row SELECT.
const ROW_COLUMNS: &str = "name, notepath, content, subnoteindex, timeadded, filemodified, \
                           filecreated, blockstartingpos, headingcontext, contenthash, vector";

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    Utf8,
    Float64,
    /// Milliseconds since the Unix epoch, stored as an integer.
    TimestampMs,
    /// Fixed-width little-endian f32 vector.
    Vector(usize),
    /// A declared type this crate never creates.
    Other(String),
}

impl DataType {
    fn declared(&self) -> String {
        match self {
            DataType::Utf8 => "TEXT".to_string(),
            DataType::Float64 => "REAL".to_string(),
            DataType::TimestampMs => "TIMESTAMP_MS".to_string(),
            DataType::Vector(dim) => format!("F32_BLOB({})", dim),
            DataType::Other(decl) => decl.clone(),
        }
    }

    fn parse(declared: &str) -> Self {
        let upper = declared.trim().to_ascii_uppercase();
        match upper.as_str() {
            "TEXT" => DataType::Utf8,
            "REAL" => DataType::Float64,
            "TIMESTAMP_MS" => DataType::TimestampMs,
            _ => upper
                .strip_prefix("F32_BLOB(")
                .and_then(|rest| rest.strip_suffix(')'))
                .and_then(|dim| dim.trim().parse().ok())
                .map(DataType::Vector)
                .unwrap_or_else(|| DataType::Other(declared.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl FieldDef {
    fn new(name: &str, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            nullable,
        }
    }
}

/// Equality is by field name, type and nullability; field order is ignored.
#[derive(Debug, Clone)]
pub struct TableSchema {
    fields: Vec<FieldDef>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    /// The index entry schema for vectors of width `dim`.
    pub fn for_dimension(dim: usize) -> Self {
        Self::new(vec![
            FieldDef::new("name", DataType::Utf8, false),
            FieldDef::new("notepath", DataType::Utf8, false),
            FieldDef::new("vector", DataType::Vector(dim), false),
            FieldDef::new("content", DataType::Utf8, false),
            FieldDef::new("subnoteindex", DataType::Float64, false),
            FieldDef::new("timeadded", DataType::TimestampMs, false),
            FieldDef::new("filemodified", DataType::TimestampMs, false),
            FieldDef::new("filecreated", DataType::TimestampMs, false),
            FieldDef::new("blockstartingpos", DataType::Float64, true),
            FieldDef::new("headingcontext", DataType::Utf8, true),
            FieldDef::new("contenthash", DataType::Utf8, true),
        ])
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn vector_dim(&self) -> Option<usize> {
        self.fields.iter().find_map(|f| match f.data_type {
            DataType::Vector(dim) => Some(dim),
            _ => None,
        })
    }

    fn create_sql(&self, table: &str) -> String {
        let columns: Vec<String> = self
            .fields
            .iter()
            .map(|f| {
                let not_null = if f.nullable { "" } else { " NOT NULL" };
                format!("{} {}{}", quote_ident(&f.name), f.data_type.declared(), not_null)
            })
            .collect();
        format!("CREATE TABLE {} ({})", quote_ident(table), columns.join(", "))
    }

    fn read(conn: &Connection, table: &str) -> AppResult<Option<Self>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let fields = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let declared: String = row.get(2)?;
                let not_null: i64 = row.get(3)?;
                Ok(FieldDef {
                    name,
                    data_type: DataType::parse(&declared),
                    nullable: not_null == 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((!fields.is_empty()).then(|| Self::new(fields)))
    }
}

impl PartialEq for TableSchema {
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .all(|f| other.fields.iter().any(|o| o == f))
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One chunk of one note, as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexEntry {
    /// File name of the note.
    pub name: String,
    /// Absolute path of the note.
    pub notepath: String,
    pub content: String,
    /// Chunk ordinal within the note.
    pub subnote_index: usize,
    pub time_added: DateTime<Utc>,
    pub file_modified: DateTime<Utc>,
    pub file_created: DateTime<Utc>,
    pub block_starting_pos: Option<usize>,
    pub heading_context: Option<String>,
    pub content_hash: Option<String>,
    #[serde(skip)]
    pub vector: Vec<f32>,
}

/// Per-note projection used by reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedFile {
    pub notepath: String,
    pub file_modified_ms: i64,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub entry: IndexEntry,
    /// Cosine distance, lower is closer.
    pub distance: f32,
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_entry(row: &Row) -> rusqlite::Result<IndexEntry> {
    let blob: Vec<u8> = row.get(10)?;
    Ok(IndexEntry {
        name: row.get(0)?,
        notepath: row.get(1)?,
        content: row.get(2)?,
        subnote_index: row.get::<_, f64>(3)? as usize,
        time_added: timestamp(row.get(4)?),
        file_modified: timestamp(row.get(5)?),
        file_created: timestamp(row.get(6)?),
        block_starting_pos: row.get::<_, Option<f64>>(7)?.map(|p| p as usize),
        heading_context: row.get(8)?,
        content_hash: row.get(9)?,
        vector: decode_vector(&blob),
    })
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ---------------------------------------------------------------------------
// Names and predicates
// ---------------------------------------------------------------------------

/// Replace characters that are unsafe in a table identity with `_`.
pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if UNSAFE_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

pub fn table_name(embedding_name: &str, vault_dir: &Path) -> String {
    format!(
        "{}{}_{}",
        TABLE_PREFIX,
        sanitize(embedding_name),
        sanitize(&vault_dir.to_string_lossy())
    )
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// SQL string literal with `'` doubled.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `notepath IN (...)` over escaped literals.
pub fn notepath_in<S: AsRef<str>>(paths: &[S]) -> String {
    let literals: Vec<String> = paths.iter().map(|p| quote_literal(p.as_ref())).collect();
    format!("notepath IN ({})", literals.join(", "))
}

/// Rows for `dir` itself or anything beneath it.
pub fn notepath_under(dir: &str) -> String {
    let prefix = dir_prefix(dir);
    format!(
        "(notepath = {} OR substr(notepath, 1, {}) = {})",
        quote_literal(dir.trim_end_matches(['/', '\\'])),
        prefix.chars().count(),
        quote_literal(&prefix)
    )
}

fn dir_prefix(dir: &str) -> String {
    format!("{}{}", dir.trim_end_matches(['/', '\\']), std::path::MAIN_SEPARATOR)
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Shared handle on the vector database. Statements run on the blocking pool.
#[derive(Clone)]
pub struct VectorDb {
    conn: Arc<Mutex<Connection>>,
}

impl VectorDb {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        info!("Vector database opened at {}", path.display());
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> AppResult<Self> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (name TEXT PRIMARY KEY, model TEXT NOT NULL, vault TEXT NOT NULL)",
                REGISTRY_TABLE
            ),
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&mut Connection) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| AppError::IndexError(format!("Storage task failed: {}", e)))?
    }

    pub async fn table_names(&self) -> AppResult<Vec<String>> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    /// Open an existing table with its live schema.
    pub async fn open_table(&self, name: &str) -> AppResult<Option<VectorTable>> {
        let table = name.to_string();
        let schema = self.call(move |conn| TableSchema::read(conn, &table)).await?;
        Ok(schema.map(|schema| VectorTable {
            db: self.clone(),
            name: name.to_string(),
            schema,
        }))
    }

    pub async fn create_empty_table(&self, name: &str, schema: TableSchema) -> AppResult<VectorTable> {
        let sql = schema.create_sql(name);
        let index_sql = format!(
            "CREATE INDEX {} ON {} (notepath)",
            quote_ident(&format!("{}_notepath", name)),
            quote_ident(name)
        );
        self.call(move |conn| {
            conn.execute(&sql, [])?;
            conn.execute(&index_sql, [])?;
            Ok(())
        })
        .await?;
        Ok(VectorTable {
            db: self.clone(),
            name: name.to_string(),
            schema,
        })
    }

    pub async fn drop_table(&self, name: &str) -> AppResult<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(name));
        self.call(move |conn| {
            conn.execute(&sql, [])?;
            Ok(())
        })
        .await
    }
}

/// Open the table for `(embedding model, vault)`, creating it if absent and
/// recreating it if its live schema differs from the one the model implies.
pub async fn get_or_create_table(
    db: &VectorDb,
    embedding: &EmbeddingFunction,
    vault_dir: &Path,
) -> AppResult<VectorTable> {
    get_or_create_table_for(db, embedding.name(), embedding.dimensionality(), vault_dir).await
}

pub async fn get_or_create_table_for(
    db: &VectorDb,
    embedding_name: &str,
    dimensionality: usize,
    vault_dir: &Path,
) -> AppResult<VectorTable> {
    let name = table_name(embedding_name, vault_dir);
    let expected = TableSchema::for_dimension(dimensionality);

    let table = match db.open_table(&name).await? {
        Some(table) if table.schema == expected => {
            debug!("Vector table {} matches current model", name);
            table
        }
        Some(table) => {
            info!(
                "Vector table {} schema changed (vector width {:?} -> {}), recreating",
                name,
                table.schema.vector_dim(),
                dimensionality
            );
            db.drop_table(&name).await?;
            db.create_empty_table(&name, expected).await?
        }
        None => {
            info!("Creating vector table {} ({}d)", name, dimensionality);
            db.create_empty_table(&name, expected).await?
        }
    };

    let vault = vault_dir.to_string_lossy().into_owned();
    register_table(db, &name, embedding_name, &vault).await?;
    prune_other_models(db, &name, &vault).await;
    Ok(table)
}

async fn register_table(db: &VectorDb, name: &str, model: &str, vault: &str) -> AppResult<()> {
    let sql = format!(
        "INSERT INTO {} (name, model, vault) VALUES (?1, ?2, ?3) \
         ON CONFLICT(name) DO UPDATE SET model = excluded.model, vault = excluded.vault",
        REGISTRY_TABLE
    );
    let params = (name.to_string(), model.to_string(), vault.to_string());
    db.call(move |conn| {
        conn.execute(&sql, params)?;
        Ok(())
    })
    .await
}

/// Drop tables left behind for this exact vault by previously configured
/// models. Table names alone are ambiguous once sanitized, so ownership comes
/// from the registry.
async fn prune_other_models(db: &VectorDb, current: &str, vault: &str) {
    let select = format!("SELECT name FROM {} WHERE vault = ?1 AND name != ?2", REGISTRY_TABLE);
    let params = (vault.to_string(), current.to_string());
    let stale = db
        .call(move |conn| {
            let mut stmt = conn.prepare(&select)?;
            let names = stmt
                .query_map(params, |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await;
    let names = match stale {
        Ok(names) => names,
        Err(e) => {
            warn!("Failed to list vector tables: {}", e);
            return;
        }
    };
    for name in names {
        info!("Dropping vector table {} from a previous model", name);
        if let Err(e) = db.drop_table(&name).await {
            warn!("Failed to drop {}: {}", name, e);
            continue;
        }
        let delete = format!("DELETE FROM {} WHERE name = ?1", REGISTRY_TABLE);
        if let Err(e) = db
            .call(move |conn| {
                conn.execute(&delete, [&name])?;
                Ok(())
            })
            .await
        {
            warn!("Failed to unregister dropped table: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct VectorTable {
    db: VectorDb,
    name: String,
    schema: TableSchema,
}

impl VectorTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Insert rows in a single transaction.
    pub async fn add(&self, entries: Vec<IndexEntry>) -> AppResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let dim = self.schema.vector_dim().unwrap_or(0);
        if let Some(bad) = entries.iter().find(|e| e.vector.len() != dim) {
            return Err(AppError::IndexError(format!(
                "Vector width {} does not match table width {} ({})",
                bad.vector.len(),
                dim,
                bad.notepath
            )));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            quote_ident(&self.name),
            ROW_COLUMNS
        );
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(&sql)?;
                    for entry in &entries {
                        stmt.execute(params![
                            entry.name,
                            entry.notepath,
                            entry.content,
                            entry.subnote_index as f64,
                            entry.time_added.timestamp_millis(),
                            entry.file_modified.timestamp_millis(),
                            entry.file_created.timestamp_millis(),
                            entry.block_starting_pos.map(|p| p as f64),
                            entry.heading_context,
                            entry.content_hash,
                            encode_vector(&entry.vector),
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(entries.len())
            })
            .await
    }

    /// Delete every row matching a SQL boolean predicate.
    pub async fn delete(&self, predicate: &str) -> AppResult<usize> {
        let sql = format!("DELETE FROM {} WHERE {}", quote_ident(&self.name), predicate);
        self.db.call(move |conn| Ok(conn.execute(&sql, [])?)).await
    }

    pub async fn count_rows(&self, predicate: Option<&str>) -> AppResult<usize> {
        let sql = match predicate {
            Some(p) => format!("SELECT COUNT(*) FROM {} WHERE {}", quote_ident(&self.name), p),
            None => format!("SELECT COUNT(*) FROM {}", quote_ident(&self.name)),
        };
        self.db
            .call(move |conn| {
                let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
                Ok(count as usize)
            })
            .await
    }

    /// One entry per indexed note: path, oldest modified time and hash.
    pub async fn indexed_files(&self) -> AppResult<Vec<IndexedFile>> {
        let sql = format!(
            "SELECT notepath, MIN(filemodified), MIN(contenthash) FROM {} GROUP BY notepath",
            quote_ident(&self.name)
        );
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let files = stmt
                    .query_map([], |row| {
                        Ok(IndexedFile {
                            notepath: row.get(0)?,
                            file_modified_ms: row.get(1)?,
                            content_hash: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(files)
            })
            .await
    }

    pub async fn rows_for_path(&self, notepath: &str) -> AppResult<Vec<IndexEntry>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE notepath = ?1 ORDER BY subnoteindex",
            ROW_COLUMNS,
            quote_ident(&self.name)
        );
        let notepath = notepath.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![notepath], row_to_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Exact nearest-neighbour search by cosine distance, closest first.
    pub async fn vector_search(
        &self,
        query: Vec<f32>,
        limit: usize,
        predicate: Option<&str>,
    ) -> AppResult<Vec<SearchHit>> {
        let sql = match predicate {
            Some(p) => format!("SELECT {} FROM {} WHERE {}", ROW_COLUMNS, quote_ident(&self.name), p),
            None => format!("SELECT {} FROM {}", ROW_COLUMNS, quote_ident(&self.name)),
        };
        let rows = self
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], row_to_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| AppError::SearchError(e.to_string()))?;

        let mut hits: Vec<SearchHit> = rows
            .into_par_iter()
            .map(|entry| SearchHit {
                distance: cosine_distance(&query, &entry.vector),
                entry,
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Move rows from `old` to `new`. When `old` is a directory, every row
    /// beneath it moves too. Returns the number of rows rewritten.
    pub async fn rename_path(&self, old: &str, new: &str) -> AppResult<usize> {
        let table = quote_ident(&self.name);
        let select = format!(
            "SELECT DISTINCT notepath FROM {} WHERE {}",
            table,
            notepath_under(old)
        );
        let update = format!("UPDATE {} SET notepath = ?1, name = ?2 WHERE notepath = ?3", table);
        let old = old.trim_end_matches(['/', '\\']).to_string();
        let new = new.trim_end_matches(['/', '\\']).to_string();

        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let paths = {
                    let mut stmt = tx.prepare(&select)?;
                    let paths = stmt
                        .query_map([], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    paths
                };
                let mut moved = 0;
                for path in paths {
                    let renamed = if path == old {
                        new.clone()
                    } else {
                        format!("{}{}", new, &path[old.len()..])
                    };
                    let name = Path::new(&renamed)
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    moved += tx.execute(&update, params![renamed, name, path])?;
                }
                tx.commit()?;
                Ok(moved)
            })
            .await
    }
}
