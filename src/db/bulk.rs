// Bulk Operations
// Paged scans, update/delete by query, batches and replace on top of the single-record pipeline

use crate::db::capacity::{check_capacity, Capacity, CapacityOptions};
use crate::db::catalog::Catalog;
use crate::db::prepare::text;
use crate::db::request::{QueryOptions, QueryResult};
use crate::db::traits::{DbError, DbResult, Op, Record};
use futures::{stream, StreamExt};
use serde_json::Value;
use std::cmp::Ordering;

/// Options for `scanner`/`scan`
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Rows per select
    pub page: usize,
    /// Stop after this many rows
    pub limit: Option<usize>,
    /// Passed to every select
    pub options: QueryOptions,
    /// Share of the read capacity this scan may use, defaults to the catalog's scan factor
    pub factor: Option<f64>,
    /// Explicit units per second instead of the configured capacity
    pub capacity: Option<f64>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            page: 100,
            limit: None,
            options: QueryOptions::default(),
            factor: None,
            capacity: None,
        }
    }
}

/// Cursor over all rows matching a query, one page per call
pub struct Scanner<'a> {
    catalog: &'a Catalog,
    table: String,
    query: Record,
    opts: ScanOptions,
    capacity: Capacity,
    token: Option<Value>,
    fetched: usize,
    done: bool,
}

impl Scanner<'_> {
    /// Next page, None once the cursor or the limit is exhausted
    ///
    /// Pages emptied by post-processing are skipped while the cursor still points at more rows.
    pub async fn next_page(&mut self) -> DbResult<Option<Vec<Record>>> {
        loop {
            if self.done {
                return Ok(None);
            }
            let mut count = self.opts.page.max(1);
            if let Some(limit) = self.opts.limit {
                let remaining = limit.saturating_sub(self.fetched);
                if remaining == 0 {
                    self.done = true;
                    return Ok(None);
                }
                // Shrink the last page so the limit is never overshot
                count = count.min(remaining);
            }

            let options = self
                .opts
                .options
                .clone()
                .with_count(count)
                .with_start(self.token.take());
            let res = self
                .catalog
                .select(&self.table, self.query.clone(), options)
                .await?;

            let units = res.info.consumed_capacity.unwrap_or(res.rows.len() as f64);
            check_capacity(&self.capacity, units).await;

            self.fetched += res.rows.len();
            self.token = res.info.next_token;
            if self.token.is_none() || self.opts.limit.map_or(false, |l| self.fetched >= l) {
                self.done = true;
            }
            if !res.rows.is_empty() {
                return Ok(Some(res.rows));
            }
            tracing::debug!(table = %self.table, "Scan page empty after filtering, continuing");
        }
    }

    /// Resume token of the page after the last one returned
    pub fn next_token(&self) -> Option<&Value> {
        self.token.as_ref()
    }

    pub fn fetched(&self) -> usize {
        self.fetched
    }
}

/// Options for `update_all`, `del_all` and `batch`
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// Operations in flight at once, results are consumed in input order
    pub concurrency: usize,
    /// Collect per-row failures instead of aborting
    pub ignore_error: bool,
    /// Columns to pre-select, defaults to the primary key
    pub select: Option<Vec<String>>,
    /// Share of the write capacity to use
    pub factor: Option<f64>,
    /// Passed to the select and every per-row operation
    pub options: QueryOptions,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            ignore_error: false,
            select: None,
            factor: None,
            options: QueryOptions::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct BulkResult {
    pub affected: u64,
    /// Records that failed when `ignore_error` is set
    pub errors: Vec<(Record, DbError)>,
}

/// One operation of a `batch`
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub op: Op,
    pub table: String,
    pub record: Record,
    pub options: QueryOptions,
}

impl BatchItem {
    pub fn new(op: Op, table: &str, record: Record) -> Self {
        Self {
            op,
            table: table.to_string(),
            record,
            options: QueryOptions::default(),
        }
    }
}

/// Skip strategies for `replace`; `check_data` takes precedence when both are set
#[derive(Debug, Clone, Default)]
pub struct ReplaceOptions {
    /// Skip the write when these columns are unchanged, empty means every column of the record
    pub check_data: Option<Vec<String>>,
    /// Skip the write unless this column is newer in the record than in the stored row
    pub check_mtime: Option<String>,
    pub options: QueryOptions,
}

fn is_newer(incoming: Option<&Value>, stored: Option<&Value>) -> bool {
    match (incoming, stored) {
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a > b,
            _ => text(a).cmp(&text(b)) == Ordering::Greater,
        },
        (Some(_), None) => true,
        _ => false,
    }
}

impl Catalog {
    pub fn scanner(&self, table: &str, query: Record, opts: ScanOptions) -> Scanner<'_> {
        let factor = opts.factor.unwrap_or(self.capacity_factors().scan);
        let capacity = self.get_capacity(
            table,
            &CapacityOptions {
                capacity: opts.capacity,
                factor: Some(factor),
                ..Default::default()
            },
        );
        Scanner {
            catalog: self,
            table: table.to_string(),
            query,
            opts,
            capacity,
            token: None,
            fetched: 0,
            done: false,
        }
    }

    /// Paged scan with a per-batch callback, returns the number of rows seen
    pub async fn scan<F>(&self, table: &str, query: Record, opts: ScanOptions, mut on_batch: F) -> DbResult<usize>
    where
        F: FnMut(Vec<Record>) -> DbResult<()>,
    {
        let mut scanner = self.scanner(table, query, opts);
        while let Some(rows) = scanner.next_page().await? {
            on_batch(rows)?;
        }
        tracing::debug!(table, rows = scanner.fetched(), "Scan complete");
        Ok(scanner.fetched())
    }

    /// Paged scan with a per-row callback
    pub async fn scan_each<F>(&self, table: &str, query: Record, opts: ScanOptions, mut on_row: F) -> DbResult<usize>
    where
        F: FnMut(Record) -> DbResult<()>,
    {
        self.scan(table, query, opts, |rows| rows.into_iter().try_for_each(&mut on_row))
            .await
    }

    /// Every row matching `query`, keys only unless `select` says otherwise
    async fn matching_keys(&self, table: &str, query: Record, opts: &BulkOptions) -> DbResult<Vec<Record>> {
        let select = opts
            .select
            .clone()
            .unwrap_or_else(|| self.schema().get_keys(table));
        let mut options = opts.options.clone();
        if !select.is_empty() {
            options.select = Some(select);
        }
        let scan = ScanOptions {
            options,
            ..Default::default()
        };
        let mut rows = Vec::new();
        self.scan(table, query, scan, |batch| {
            rows.extend(batch);
            Ok(())
        })
        .await?;
        Ok(rows)
    }

    /// Update every row matching `query` with the values of `update`
    pub async fn update_all(&self, table: &str, query: Record, update: Record, opts: BulkOptions) -> DbResult<BulkResult> {
        let records: Vec<Record> = self
            .matching_keys(table, query, &opts)
            .await?
            .into_iter()
            .map(|mut row| {
                row.extend(update.clone());
                row
            })
            .collect();
        let factor = opts.factor.unwrap_or(self.capacity_factors().update);
        self.apply_each(table, Op::Update, records, &opts, factor).await
    }

    /// Delete every row matching `query`
    pub async fn del_all(&self, table: &str, query: Record, opts: BulkOptions) -> DbResult<BulkResult> {
        let records = self.matching_keys(table, query, &opts).await?;
        let factor = opts.factor.unwrap_or(self.capacity_factors().delete);
        self.apply_each(table, Op::Del, records, &opts, factor).await
    }

    async fn apply_each(
        &self,
        table: &str,
        op: Op,
        records: Vec<Record>,
        opts: &BulkOptions,
        factor: f64,
    ) -> DbResult<BulkResult> {
        let capacity = self.get_capacity(
            table,
            &CapacityOptions {
                factor: Some(factor),
                use_write: true,
                ..Default::default()
            },
        );
        let capacity = &capacity;
        let total = records.len();
        let mut results = stream::iter(records.into_iter().map(|record| async move {
            check_capacity(capacity, 1.0).await;
            let res = self.run(op, table, record.clone(), opts.options.clone()).await;
            (record, res)
        }))
        .buffered(opts.concurrency.max(1));

        let mut out = BulkResult::default();
        while let Some((record, res)) = results.next().await {
            match res {
                Ok(res) => out.affected += res.info.affected_rows,
                Err(e) if opts.ignore_error => {
                    tracing::warn!(table, op = %op, error = %e, "Bulk operation failed for record");
                    out.errors.push((record, e));
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(table, op = %op, total, affected = out.affected, errors = out.errors.len(), "Bulk operation complete");
        Ok(out)
    }

    /// Run a list of writes across tables
    pub async fn batch(&self, items: Vec<BatchItem>, opts: BulkOptions) -> DbResult<BulkResult> {
        let mut results = stream::iter(items.into_iter().map(|item| async move {
            let res = self.run(item.op, &item.table, item.record.clone(), item.options).await;
            (item.record, res)
        }))
        .buffered(opts.concurrency.max(1));

        let mut out = BulkResult::default();
        while let Some((record, res)) = results.next().await {
            match res {
                Ok(res) => out.affected += res.info.affected_rows,
                Err(e) if opts.ignore_error => out.errors.push((record, e)),
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Add the record when missing, update it when it changed, otherwise do nothing
    pub async fn replace(&self, table: &str, record: Record, opts: ReplaceOptions) -> DbResult<QueryResult> {
        let keys = self.schema().get_keys(table);
        let query: Record = keys
            .iter()
            .filter_map(|k| record.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        let existing = self.get(table, query, opts.options.clone()).await?;
        let Some(existing) = existing else {
            return self.add(table, record, opts.options).await;
        };

        let unchanged = if let Some(columns) = &opts.check_data {
            let columns: Vec<&String> = if columns.is_empty() {
                record.keys().collect()
            } else {
                columns.iter().collect()
            };
            columns
                .iter()
                .all(|c| record.get(*c).map(text) == existing.get(*c).map(text))
        } else if let Some(mtime) = &opts.check_mtime {
            !is_newer(record.get(mtime), existing.get(mtime))
        } else {
            false
        };
        if unchanged {
            tracing::debug!(table, "Replace skipped, record unchanged");
            return Ok(QueryResult::default());
        }
        self.update(table, record, opts.options).await
    }
}
