//! Tenant-scoped query construction.

use serde_json::Value;

use crate::tenant::{TenantContext, TenantId};

/// Caller-supplied narrowing for list reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    fields: Vec<(String, Value)>,
    limit: Option<usize>,
    offset: usize,
}

impl RecordFilter {
    /// Creates a filter matching every record of the table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires the JSON field at `path` (dot separated) to equal `value`.
    pub fn with_field(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((path.into(), value.into()));
        self
    }

    /// Limits the number of records returned.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` records.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// A query that is always restricted to one tenant.
///
/// The only public constructor takes a [`TenantContext`], so a query cannot
/// exist without an authorized tenant, and [`TenantScopedQuery::where_clause`]
/// always starts with the tenant predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantScopedQuery {
    tenant_id: TenantId,
    table: String,
    record_id: Option<String>,
    filter: RecordFilter,
}

/// A rendered WHERE clause with positional `?N` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhereClause {
    /// SQL text starting with the tenant predicate.
    pub sql: String,
    /// Bound values in placeholder order.
    pub params: Vec<String>,
}

impl TenantScopedQuery {
    /// Creates a query over `table` scoped to the context's tenant.
    pub fn for_context(context: &TenantContext, table: impl Into<String>) -> Self {
        Self::new(context.tenant_id().clone(), table)
    }

    pub(crate) fn new(tenant_id: TenantId, table: impl Into<String>) -> Self {
        Self {
            tenant_id,
            table: table.into(),
            record_id: None,
            filter: RecordFilter::default(),
        }
    }

    /// Restricts the query to one record.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    /// Applies a caller filter.
    pub fn with_filter(mut self, filter: RecordFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Tenant every row must belong to.
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Table queried.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Single record id, if the query targets one.
    pub fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }

    /// Maximum rows returned.
    pub fn limit(&self) -> Option<usize> {
        self.filter.limit
    }

    /// Rows skipped before the first returned.
    pub fn offset(&self) -> usize {
        self.filter.offset
    }

    /// Renders the WHERE clause.
    ///
    /// Field filters bind both the JSON path and the JSON-encoded value, so
    /// no caller text is ever spliced into the SQL.
    pub fn where_clause(&self) -> WhereClause {
        let mut sql = String::from("tenant_id = ?1 AND table_name = ?2");
        let mut params = vec![self.tenant_id.as_str().to_string(), self.table.clone()];

        if let Some(id) = &self.record_id {
            params.push(id.clone());
            sql.push_str(&format!(" AND id = ?{}", params.len()));
        }

        for (path, value) in &self.filter.fields {
            params.push(format!("$.{}", path));
            let path_idx = params.len();
            params.push(value.to_string());
            let value_idx = params.len();
            sql.push_str(&format!(
                " AND json_extract(data, ?{}) IS json_extract(?{}, '$')",
                path_idx, value_idx
            ));
        }

        WhereClause { sql, params }
    }
}
