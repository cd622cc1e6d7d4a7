//! In-memory source and partitions for unit tests.
//!
//! Every column is a nullable `bigint`. Row selections are evaluated directly
//! over the stored rows with the same semantics as the SQL they render to, and
//! exports and imports go through real binary COPY framing.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream;
use tokio_util::sync::CancellationToken;

use crate::config::{DistributionPolicy, TableFilter, TargetMode};
use crate::core::{
    ByteStream, CatalogSource, ColumnInfo, ConstraintInfo, ConstraintKind, CopySource,
    ForeignKeyEdge, ImportWriter, PartitionSink, SourceDatabase, TableRef,
};
use crate::error::{PartitionError, Result};
use crate::graph::{build_graph, DependencyGraph};
use crate::plan::{
    block_bounds, build_plan, bucket_for, BucketAssignment, ColumnRef, PlanContext, Planner, RowFilter,
    RowSelection, TransferJob,
};
use crate::rules::{JoinOverride, MetadataCollector, RuleSettings, SplitRule};
use crate::transfer::{TransferEngine, PG_COPY_SIGNATURE};

pub type Row = Vec<Option<i64>>;

const EXPORT_CHUNK: usize = 7;

#[derive(Debug, Clone, Default)]
struct MemTable {
    columns: Vec<String>,
    primary_key: Vec<String>,
    rows: Vec<Row>,
}

impl MemTable {
    fn index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// Source database held in memory.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    schema: String,
    tables: BTreeMap<String, MemTable>,
    foreign_keys: Vec<(String, String)>,
    fail_catalog: bool,
    listings_left: Option<Arc<AtomicUsize>>,
    failing: BTreeSet<String>,
    truncate_exports: bool,
}

impl MemoryDatabase {
    pub fn new(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            tables: BTreeMap::new(),
            foreign_keys: Vec::new(),
            fail_catalog: false,
            listings_left: None,
            failing: BTreeSet::new(),
            truncate_exports: false,
        }
    }

    pub fn table(mut self, name: &str, columns: &[&str], primary_key: &[&str]) -> Self {
        self.tables.insert(
            name.to_string(),
            MemTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
        self
    }

    pub fn rows(mut self, name: &str, rows: Vec<Row>) -> Self {
        let table = self.tables.entry(name.to_string()).or_default();
        table.rows.extend(rows);
        self
    }

    pub fn foreign_key(mut self, from: &str, to: &str) -> Self {
        self.foreign_keys.push((from.to_string(), to.to_string()));
        self
    }

    /// Listing tables and foreign keys fails.
    pub fn fail_catalog(mut self) -> Self {
        self.fail_catalog = true;
        self
    }

    /// Table listing works `times` times, shared across clones, then fails.
    pub fn fail_catalog_after(mut self, times: usize) -> Self {
        self.listings_left = Some(Arc::new(AtomicUsize::new(times)));
        self
    }

    /// Every per-table query against `name` fails.
    pub fn fail_table(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// Exports stop a few bytes short of the trailer.
    pub fn truncate_exports(mut self) -> Self {
        self.truncate_exports = true;
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    fn def(&self, table: &TableRef) -> &MemTable {
        match self.tables.get(&table.name) {
            Some(def) => def,
            None => panic!("no table {} in memory database", table),
        }
    }

    fn checked(&self, table: &TableRef) -> Result<&MemTable> {
        if self.failing.contains(&table.name) {
            return Err(PartitionError::Config(format!("simulated failure on {}", table)));
        }
        if table.schema != self.schema {
            return Err(PartitionError::Config(format!("unknown schema {}", table.schema)));
        }
        self.tables
            .get(&table.name)
            .ok_or_else(|| PartitionError::Config(format!("relation {} does not exist", table)))
    }

    /// Primary key plus outgoing foreign keys of `name`. In-memory foreign
    /// keys carry no column list.
    fn constraints_of(&self, name: &str) -> Vec<ConstraintInfo> {
        let mut constraints = Vec::new();
        if let Some(def) = self.tables.get(name) {
            if !def.primary_key.is_empty() {
                constraints.push(ConstraintInfo {
                    name: format!("{}_pkey", name),
                    kind: ConstraintKind::PrimaryKey,
                    columns: def.primary_key.clone(),
                    references: None,
                });
            }
        }
        for (from, to) in self.foreign_keys.iter().filter(|(from, _)| from == name) {
            constraints.push(ConstraintInfo {
                name: format!("fk_{}_{}", from, to),
                kind: ConstraintKind::ForeignKey,
                columns: Vec::new(),
                references: Some(TableRef::new(self.schema.as_str(), to.as_str())),
            });
        }
        constraints
    }

    pub fn column_index(&self, table: &TableRef, column: &str) -> usize {
        match self.def(table).index(column) {
            Some(i) => i,
            None => panic!("no column {} in {}", column, table),
        }
    }

    pub fn row_total(&self, table: &TableRef) -> usize {
        self.def(table).rows.len()
    }

    pub fn rows_of(&self, table: &TableRef) -> Vec<Row> {
        self.def(table).rows.clone()
    }

    /// `value_column` of the first row of `table` whose `key_column` equals `key`.
    pub fn lookup(
        &self,
        table: &str,
        key_column: &str,
        key: Option<i64>,
        value_column: &str,
    ) -> Option<i64> {
        let key = key?;
        let def = self.tables.get(table)?;
        let k = def.index(key_column)?;
        let v = def.index(value_column)?;
        def.rows.iter().find(|r| r[k] == Some(key)).and_then(|r| r[v])
    }

    /// Rows a selection yields, in selection order.
    pub fn select(&self, table: &TableRef, selection: &RowSelection) -> Vec<Row> {
        let def = self.def(table);
        self.select_indices(table, selection)
            .into_iter()
            .map(|i| def.rows[i].clone())
            .collect()
    }

    /// Physical positions of the rows a selection yields.
    pub fn select_indices(&self, table: &TableRef, selection: &RowSelection) -> Vec<usize> {
        let def = self.def(table);
        let mut indices: Vec<usize> = (0..def.rows.len()).collect();

        match &selection.filter {
            RowFilter::All => indices,
            RowFilter::Block {
                order_by,
                offset,
                limit,
            } => {
                indices.sort_by(|&a, &b| {
                    order_by
                        .iter()
                        .map(|col| {
                            nulls_last(
                                self.value(def, selection, a, col),
                                self.value(def, selection, b, col),
                            )
                        })
                        .find(|o| *o != Ordering::Equal)
                        .unwrap_or(Ordering::Equal)
                });
                indices
                    .into_iter()
                    .skip(*offset as usize)
                    .take(*limit as usize)
                    .collect()
            }
            RowFilter::Bucket {
                key,
                assignment,
                partitions,
                index,
            } => {
                let ids = match assignment {
                    BucketAssignment::Hash => Vec::new(),
                    BucketAssignment::RoundRobin {
                        subject_table,
                        subject_column,
                    }
                    | BucketAssignment::SubjectBlock {
                        subject_table,
                        subject_column,
                    } => self.distinct_ids(subject_table, subject_column),
                };
                let n = *partitions;
                let slot_of = |value: Option<i64>| -> usize {
                    let pos = value.and_then(|v| ids.binary_search(&v).ok());
                    match (assignment, pos) {
                        (BucketAssignment::Hash, _) => bucket_for(value, n),
                        (_, None) => 0,
                        (BucketAssignment::RoundRobin { .. }, Some(pos)) => pos % n,
                        (BucketAssignment::SubjectBlock { .. }, Some(pos)) => (0..n)
                            .find(|&i| {
                                let (offset, limit) = block_bounds(ids.len() as u64, n, i);
                                (offset..offset + limit).contains(&(pos as u64))
                            })
                            .unwrap_or(0),
                    }
                };
                indices
                    .into_iter()
                    .filter(|&i| slot_of(self.value(def, selection, i, key)) == *index)
                    .collect()
            }
        }
    }

    fn distinct_ids(&self, table: &TableRef, column: &str) -> Vec<i64> {
        let col = self.column_index(table, column);
        let ids: BTreeSet<i64> = self.def(table).rows.iter().filter_map(|r| r[col]).collect();
        ids.into_iter().collect()
    }

    fn value(
        &self,
        def: &MemTable,
        selection: &RowSelection,
        row: usize,
        column: &ColumnRef,
    ) -> Option<i64> {
        match column {
            ColumnRef::Child(name) if name == "ctid" => Some(row as i64),
            ColumnRef::Child(name) => def.rows[row][def.index(name)?],
            ColumnRef::Parent(name) => {
                let join = selection.join.as_ref()?;
                let key = def.rows[row][def.index(&join.child_key)?];
                self.lookup(&join.parent_table.name, &join.parent_key, key, name)
            }
        }
    }
}

/// Text form of a row, `(1,,9201)` for `[1, NULL, 9201]`.
pub fn fingerprint(row: &[Option<i64>]) -> String {
    let fields: Vec<String> = row
        .iter()
        .map(|v| v.map(|v| v.to_string()).unwrap_or_default())
        .collect();
    format!("({})", fields.join(","))
}

fn nulls_last(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
    }
}

#[async_trait]
impl CatalogSource for MemoryDatabase {
    async fn list_tables(&self, schema: &str) -> Result<Vec<TableRef>> {
        if self.fail_catalog {
            return Err(PartitionError::Config("catalog unavailable".into()));
        }
        if let Some(left) = &self.listings_left {
            let taken = left.fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            });
            if taken.is_err() {
                return Err(PartitionError::SchemaIntrospection("catalog went away".into()));
            }
        }
        if schema != self.schema {
            return Ok(Vec::new());
        }
        Ok(self
            .tables
            .keys()
            .map(|name| TableRef::new(schema, name.as_str()))
            .collect())
    }

    async fn foreign_keys(&self, schema: &str) -> Result<Vec<ForeignKeyEdge>> {
        if self.fail_catalog {
            return Err(PartitionError::Config("catalog unavailable".into()));
        }
        Ok(self
            .foreign_keys
            .iter()
            .map(|(from, to)| ForeignKeyEdge {
                constraint_name: format!("fk_{}_{}", from, to),
                from: TableRef::new(schema, from.as_str()),
                to: TableRef::new(schema, to.as_str()),
            })
            .collect())
    }

    async fn columns(&self, table: &TableRef) -> Result<Vec<ColumnInfo>> {
        Ok(self
            .checked(table)?
            .columns
            .iter()
            .map(|c| ColumnInfo::new(c.as_str(), "bigint"))
            .collect())
    }

    async fn primary_key(&self, table: &TableRef) -> Result<Vec<String>> {
        Ok(self.checked(table)?.primary_key.clone())
    }

    async fn constraints(&self, table: &TableRef) -> Result<Vec<ConstraintInfo>> {
        self.checked(table)?;
        Ok(self.constraints_of(&table.name))
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64> {
        Ok(self.checked(table)?.rows.len() as u64)
    }

    /// The first `limit` rows rather than a random pick.
    async fn sample_rows(&self, table: &TableRef, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .checked(table)?
            .rows
            .iter()
            .take(limit)
            .map(|row| fingerprint(row))
            .collect())
    }

    async fn count_selected(&self, table: &TableRef, selection: &RowSelection) -> Result<u64> {
        self.checked(table)?;
        Ok(self.select_indices(table, selection).len() as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl CopySource for MemoryDatabase {
    async fn export(&self, table: &TableRef, selection: &RowSelection) -> Result<ByteStream> {
        self.checked(table)?;
        let mut data = encode_rows(&self.select(table, selection));
        if self.truncate_exports {
            data.truncate(data.len() - 3);
        }
        let chunks: Vec<Result<Bytes>> = data
            .chunks(EXPORT_CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

impl SourceDatabase for MemoryDatabase {}

/// Binary COPY encoding of bigint rows.
pub fn encode_rows(rows: &[Row]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(PG_COPY_SIGNATURE);
    buf.put_u32(0);
    buf.put_u32(0);
    for row in rows {
        buf.put_i16(row.len() as i16);
        for field in row {
            match field {
                Some(v) => {
                    buf.put_i32(8);
                    buf.put_i64(*v);
                }
                None => buf.put_i32(-1),
            }
        }
    }
    buf.put_i16(-1);
    buf.freeze()
}

/// Inverse of [`encode_rows`].
pub fn decode_rows(data: &[u8]) -> Result<Vec<Row>> {
    fn bad(msg: &str) -> PartitionError {
        PartitionError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string()))
    }
    fn take<'a>(data: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
        if data.len() < n {
            return Err(bad("short copy data"));
        }
        let (head, tail) = data.split_at(n);
        *data = tail;
        Ok(head)
    }

    let mut data = data;
    if take(&mut data, PG_COPY_SIGNATURE.len())? != PG_COPY_SIGNATURE {
        return Err(bad("bad signature"));
    }
    take(&mut data, 4)?;
    let ext = u32::from_be_bytes(take(&mut data, 4)?.try_into().map_err(|_| bad("ext"))?);
    take(&mut data, ext as usize)?;

    let mut rows = Vec::new();
    loop {
        let count = i16::from_be_bytes(take(&mut data, 2)?.try_into().map_err(|_| bad("count"))?);
        if count == -1 {
            break;
        }
        let mut row = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = i32::from_be_bytes(take(&mut data, 4)?.try_into().map_err(|_| bad("len"))?);
            if len == -1 {
                row.push(None);
            } else if len == 8 {
                let raw = take(&mut data, 8)?;
                row.push(Some(i64::from_be_bytes(raw.try_into().map_err(|_| bad("value"))?)));
            } else {
                return Err(bad("unexpected field width"));
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Counts concurrently open imports across any number of partitions.
#[derive(Debug, Default)]
pub struct ImportTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ImportTracker {
    pub fn peak(&self) -> usize {
        self.peak.load(AtomicOrdering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        self.peak.fetch_max(now, AtomicOrdering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, AtomicOrdering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct PartitionState {
    columns: BTreeMap<String, Vec<String>>,
    constraints: BTreeMap<String, Vec<ConstraintInfo>>,
    rows: BTreeMap<String, Vec<Row>>,
    /// Table lists of every `clear_tables` call, in order.
    clears: Vec<Vec<String>>,
}

/// A partition database held in memory.
#[derive(Debug)]
pub struct MemoryPartition {
    index: usize,
    schema: String,
    state: Arc<Mutex<PartitionState>>,
    failing_imports: BTreeSet<String>,
    panicking_imports: BTreeSet<String>,
    import_delay: Duration,
    tracker: Arc<ImportTracker>,
    unreachable: bool,
}

impl MemoryPartition {
    /// Same tables as `db`, no rows.
    pub fn empty_like(index: usize, db: &MemoryDatabase) -> Self {
        let mut state = PartitionState::default();
        for (name, def) in &db.tables {
            state.columns.insert(name.clone(), def.columns.clone());
            state.constraints.insert(name.clone(), db.constraints_of(name));
            state.rows.insert(name.clone(), Vec::new());
        }
        Self {
            index,
            schema: db.schema.clone(),
            state: Arc::new(Mutex::new(state)),
            failing_imports: BTreeSet::new(),
            panicking_imports: BTreeSet::new(),
            import_delay: Duration::ZERO,
            tracker: Arc::new(ImportTracker::default()),
            unreachable: false,
        }
    }

    /// Imports into `name` fail on their first write.
    pub fn failing_import(mut self, name: &str) -> Self {
        self.failing_imports.insert(name.to_string());
        self
    }

    /// Imports into `name` panic on their first write.
    pub fn panicking_import(mut self, name: &str) -> Self {
        self.panicking_imports.insert(name.to_string());
        self
    }

    /// Commits wait this long before applying.
    pub fn with_import_delay(mut self, delay: Duration) -> Self {
        self.import_delay = delay;
        self
    }

    pub fn tracked_by(mut self, tracker: &Arc<ImportTracker>) -> Self {
        self.tracker = Arc::clone(tracker);
        self
    }

    /// Pings fail.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn drop_table(self, name: &str) -> Self {
        {
            let mut state = self.lock();
            state.columns.remove(name);
            state.constraints.remove(name);
            state.rows.remove(name);
        }
        self
    }

    pub fn drop_column(self, table: &str, column: &str) -> Self {
        if let Some(columns) = self.lock().columns.get_mut(table) {
            columns.retain(|c| c != column);
        }
        self
    }

    /// Remove every `kind` constraint of `table`.
    pub fn drop_constraints(self, table: &str, kind: ConstraintKind) -> Self {
        if let Some(constraints) = self.lock().constraints.get_mut(table) {
            constraints.retain(|c| c.kind != kind);
        }
        self
    }

    pub fn add_constraint(self, table: &str, constraint: ConstraintInfo) -> Self {
        self.lock()
            .constraints
            .entry(table.to_string())
            .or_default()
            .push(constraint);
        self
    }

    pub fn with_rows(self, name: &str, rows: Vec<Row>) -> Self {
        self.insert_rows(name, rows);
        self
    }

    pub fn insert_rows(&self, name: &str, rows: Vec<Row>) {
        self.lock().rows.entry(name.to_string()).or_default().extend(rows);
    }

    pub fn rows_of(&self, table: &TableRef) -> Vec<Row> {
        self.lock().rows.get(&table.name).cloned().unwrap_or_default()
    }

    pub fn clears(&self) -> Vec<Vec<String>> {
        self.lock().clears.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PartitionState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl PartitionSink for MemoryPartition {
    fn index(&self) -> usize {
        self.index
    }

    fn describe(&self) -> String {
        format!("memory/{}", self.index)
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableRef>> {
        if schema != self.schema {
            return Ok(Vec::new());
        }
        Ok(self
            .lock()
            .columns
            .keys()
            .map(|name| TableRef::new(schema, name.as_str()))
            .collect())
    }

    async fn columns(&self, table: &TableRef) -> Result<Vec<ColumnInfo>> {
        self.lock()
            .columns
            .get(&table.name)
            .map(|cols| cols.iter().map(|c| ColumnInfo::new(c.as_str(), "bigint")).collect())
            .ok_or_else(|| PartitionError::Config(format!("relation {} does not exist", table)))
    }

    async fn constraints(&self, table: &TableRef) -> Result<Vec<ConstraintInfo>> {
        self.lock()
            .constraints
            .get(&table.name)
            .cloned()
            .ok_or_else(|| PartitionError::Config(format!("relation {} does not exist", table)))
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64> {
        self.lock()
            .rows
            .get(&table.name)
            .map(|rows| rows.len() as u64)
            .ok_or_else(|| PartitionError::Config(format!("relation {} does not exist", table)))
    }

    async fn matching_rows(
        &self,
        table: &TableRef,
        fingerprints: &[String],
    ) -> Result<BTreeSet<String>> {
        let state = self.lock();
        let rows = state
            .rows
            .get(&table.name)
            .ok_or_else(|| PartitionError::Config(format!("relation {} does not exist", table)))?;
        Ok(rows
            .iter()
            .map(|row| fingerprint(row))
            .filter(|f| fingerprints.contains(f))
            .collect())
    }

    async fn null_count(&self, table: &TableRef, column: &str) -> Result<u64> {
        let state = self.lock();
        let col = state
            .columns
            .get(&table.name)
            .and_then(|cols| cols.iter().position(|c| c == column))
            .ok_or_else(|| PartitionError::Config(format!("column {} does not exist", column)))?;
        Ok(state
            .rows
            .get(&table.name)
            .map(|rows| rows.iter().filter(|r| r[col].is_none()).count() as u64)
            .unwrap_or(0))
    }

    async fn clear_tables(&self, tables: &[TableRef]) -> Result<()> {
        let mut state = self.lock();
        for table in tables {
            if !state.columns.contains_key(&table.name) {
                return Err(PartitionError::Config(format!("relation {} does not exist", table)));
            }
        }
        for table in tables {
            state.rows.entry(table.name.clone()).or_default().clear();
        }
        state
            .clears
            .push(tables.iter().map(|t| t.name.clone()).collect());
        Ok(())
    }

    async fn begin_import(&self, table: &TableRef) -> Result<Box<dyn ImportWriter>> {
        if !self.lock().columns.contains_key(&table.name) {
            return Err(PartitionError::Config(format!("relation {} does not exist", table)));
        }
        self.tracker.enter();
        Ok(Box::new(MemoryImport {
            table: table.name.clone(),
            buffer: BytesMut::new(),
            state: Arc::clone(&self.state),
            fail: self.failing_imports.contains(&table.name),
            panic: self.panicking_imports.contains(&table.name),
            delay: self.import_delay,
            tracker: Arc::clone(&self.tracker),
        }))
    }

    async fn ping(&self) -> Result<()> {
        if self.unreachable {
            return Err(PartitionError::pool("connection refused", self.describe()));
        }
        Ok(())
    }
}

struct MemoryImport {
    table: String,
    buffer: BytesMut,
    state: Arc<Mutex<PartitionState>>,
    fail: bool,
    panic: bool,
    delay: Duration,
    tracker: Arc<ImportTracker>,
}

#[async_trait]
impl ImportWriter for MemoryImport {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        if self.panic {
            panic!("simulated crash importing {}", self.table);
        }
        if self.fail {
            return Err(PartitionError::Config(format!(
                "simulated import failure on {}",
                self.table
            )));
        }
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = decode_rows(&self.buffer).map(|rows| {
            let count = rows.len() as u64;
            let mut state = self.state.lock().unwrap();
            state
                .rows
                .entry(self.table.clone())
                .or_default()
                .extend(rows);
            count
        });
        self.tracker.leave();
        result
    }

    async fn abort(self: Box<Self>) {
        self.tracker.leave();
    }
}

/// A small OMOP-shaped schema:
///
/// - `person` 1..=10
/// - `visit_occurrence` 25 rows, one with a NULL person
/// - `note` and `note_nlp` (reachable, no subject column)
/// - `episode` and `episode_event` (no PK, one orphan, one NULL parent key)
/// - `concept` (12 rows) and `vocabulary` referencing each other
/// - `cdm_source` (no PK, isolated)
pub fn person_visit_fixture() -> MemoryDatabase {
    MemoryDatabase::new("cdm")
        .table("person", &["person_id", "gender_concept_id"], &["person_id"])
        .rows(
            "person",
            (1..=10).map(|id| vec![Some(id), Some(8507 + id % 2)]).collect(),
        )
        .table(
            "visit_occurrence",
            &["visit_occurrence_id", "person_id", "visit_concept_id"],
            &["visit_occurrence_id"],
        )
        .rows(
            "visit_occurrence",
            (1..=25)
                .map(|k| {
                    let person = if k == 25 { None } else { Some(k % 10 + 1) };
                    vec![Some(k), person, Some(9201)]
                })
                .collect(),
        )
        .table("note", &["note_id", "person_id"], &["note_id"])
        .rows("note", (1..=7).map(|k| vec![Some(k), Some(k % 10 + 1)]).collect())
        .table("note_nlp", &["note_nlp_id", "note_id"], &["note_nlp_id"])
        .rows("note_nlp", (1..=9).map(|k| vec![Some(k), Some(k % 7 + 1)]).collect())
        .table("episode", &["episode_id", "person_id"], &["episode_id"])
        .rows(
            "episode",
            (1..=6).map(|k| vec![Some(k), Some(k * 3 % 10 + 1)]).collect(),
        )
        .table("episode_event", &["episode_id", "event_id"], &[])
        .rows(
            "episode_event",
            (1..=9)
                .map(|k| vec![Some(k % 6 + 1), Some(k)])
                .chain([vec![Some(99), Some(10)], vec![None, Some(11)]])
                .collect(),
        )
        .table("concept", &["concept_id", "vocabulary_concept_id"], &["concept_id"])
        .rows("concept", (1..=12).map(|k| vec![Some(k), Some(k % 3)]).collect())
        .table("vocabulary", &["vocabulary_id", "vocabulary_concept_id"], &["vocabulary_id"])
        .rows("vocabulary", (0..3).map(|k| vec![Some(k), Some(k)]).collect())
        .table("cdm_source", &["cdm_version_concept_id"], &[])
        .rows("cdm_source", vec![vec![Some(756265)]])
        .foreign_key("visit_occurrence", "person")
        .foreign_key("visit_occurrence", "concept")
        .foreign_key("note", "person")
        .foreign_key("note_nlp", "note")
        .foreign_key("episode", "person")
        .foreign_key("episode_event", "episode")
        .foreign_key("person", "concept")
        .foreign_key("concept", "vocabulary")
        .foreign_key("vocabulary", "concept")
}

/// Rule settings matching [`person_visit_fixture`]: threshold 10 and the
/// `episode_event -> episode` link.
pub fn fixture_settings() -> RuleSettings {
    let mut overrides = BTreeMap::new();
    overrides.insert(
        TableRef::new("cdm", "episode_event"),
        JoinOverride {
            parent_table: TableRef::new("cdm", "episode"),
            child_key: "episode_id".to_string(),
            parent_key: "episode_id".to_string(),
            parent_subject_column: "person_id".to_string(),
        },
    );
    RuleSettings {
        schema: "cdm".to_string(),
        subject_table: TableRef::new("cdm", "person"),
        subject_column: "person_id".to_string(),
        large_table_threshold: 10,
        hash_key_pattern: "concept_id".to_string(),
        overrides,
    }
}

pub async fn fixture_graph(db: &MemoryDatabase) -> DependencyGraph {
    build_graph(db, db.schema()).await.unwrap()
}

/// Resolve and plan every table of `db` with `planner`.
pub async fn planned_jobs(
    db: &MemoryDatabase,
    planner: &dyn Planner,
    partitions: usize,
) -> Vec<(TableRef, SplitRule, Vec<TransferJob>)> {
    let graph = fixture_graph(db).await;
    let settings = fixture_settings();
    let collector = MetadataCollector::new(db, &graph, &settings);
    let ctx = PlanContext {
        partitions,
        subject_table: settings.subject_table.clone(),
        subject_column: settings.subject_column.clone(),
    };

    let mut planned = Vec::new();
    for table in graph.tables() {
        let (metadata, rule) = collector.resolve(table).await.unwrap();
        let jobs = planner.plan_jobs(table, &rule, &metadata, &ctx);
        planned.push((table.clone(), rule, jobs));
    }
    planned
}

/// Replicated tables: every job selects every row. Split tables: the jobs'
/// row sets are disjoint and cover the table.
pub fn assert_partitioned(
    db: &MemoryDatabase,
    table: &TableRef,
    rule: &SplitRule,
    jobs: &[TransferJob],
) {
    let total = db.row_total(table);
    if rule.is_replicated() {
        for job in jobs {
            assert_eq!(db.select_indices(table, &job.selection).len(), total, "{}", table);
        }
        return;
    }
    let mut seen: Vec<usize> = jobs
        .iter()
        .flat_map(|job| db.select_indices(table, &job.selection))
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..total).collect::<Vec<_>>(), "{} under {}", table, rule);
}

/// Plan `db` under `policy` and run every job into fresh in-memory partitions.
pub async fn distribute(
    db: &MemoryDatabase,
    policy: DistributionPolicy,
    partitions: usize,
) -> Vec<Arc<MemoryPartition>> {
    let graph = fixture_graph(db).await;
    let plan = build_plan(
        db,
        &graph,
        &fixture_settings(),
        &TableFilter::all(),
        policy,
        partitions,
    )
    .await
    .unwrap();

    let targets: Vec<Arc<MemoryPartition>> = (0..partitions)
        .map(|i| Arc::new(MemoryPartition::empty_like(i, db)))
        .collect();
    let engine = Arc::new(TransferEngine::new(
        Arc::new(db.clone()),
        targets
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn PartitionSink>)
            .collect(),
        TargetMode::Truncate,
    ));
    let summary = engine
        .run_waves(plan.job_waves(), 4, CancellationToken::new())
        .await;
    assert!(summary.failed.is_empty(), "{:?}", summary.failed);
    targets
}
