//! Statement rendering for entity operations.
//!
//! Every identifier in the output comes from registered metadata and every
//! caller-supplied value is bound as a parameter, so the SQL text of a
//! statement depends only on the shape of the request, never on its values.

use keel_core::{
    ColumnDef, Dialect, EntityMetadata, Error, KeyRetrieval, LinkTable, PersistenceError,
    PersistenceErrorKind, QueryErrorKind, Registry, RelationshipDef, Result, Value,
};

use crate::clause::{Comparator, Filter, Operand, Order, Sort};
use crate::eager::{self, FetchPlan, RelatedFetch};
use crate::query::{Operation, QuerySpec};
use crate::statement::{BoundStatement, SqlWriter};

/// An INSERT plus how the generated key (if any) is read back.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    /// Registered name of the inserted entity
    pub entity: &'static str,
    pub statement: BoundStatement,
    /// `None` when the entity supplied its own primary key
    pub key_retrieval: Option<KeyRetrieval>,
}

/// A SELECT plus the relationships it joins and the ones left for follow-up fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub statement: BoundStatement,
    pub plan: FetchPlan,
}

/// Renders statements in one dialect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryBuilder {
    dialect: Dialect,
}

impl QueryBuilder {
    pub const fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Render `spec` according to its [`Operation`].
    #[allow(clippy::result_large_err)]
    pub fn build(
        &self,
        registry: &Registry,
        meta: &EntityMetadata,
        spec: &QuerySpec,
    ) -> Result<BoundStatement> {
        match spec.operation {
            Operation::Select => self.select(registry, meta, spec).map(|s| s.statement),
            Operation::Count => self.count(meta, spec),
            Operation::Delete => self.delete(meta, spec),
        }
    }

    /// `INSERT` of one entity's column values (in column order).
    ///
    /// Generated columns holding null are left out so the database assigns
    /// them. When the primary key is among them the dialect decides how the
    /// new key comes back.
    #[allow(clippy::result_large_err)]
    pub fn insert(&self, meta: &EntityMetadata, values: &[Value]) -> Result<InsertStatement> {
        check_arity(meta, values)?;
        let (columns, bound): (Vec<&ColumnDef>, Vec<Value>) = meta
            .columns()
            .iter()
            .zip(values)
            .filter(|(col, value)| !(col.generated && value.is_null()))
            .map(|(col, value)| (col, value.clone()))
            .unzip();

        let mut w = SqlWriter::new(self.dialect);
        w.push("INSERT INTO ").ident(meta.table());
        if bound.is_empty() && self.dialect == Dialect::Postgres {
            w.push(" DEFAULT VALUES");
        } else {
            w.push(" (");
            for (i, col) in columns.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.ident(col.column);
            }
            w.push(") VALUES ").bind_list(bound);
        }

        let pk_index = meta.primary_key_index();
        let key_retrieval = if values[pk_index].is_null() {
            let retrieval = self.dialect.key_retrieval();
            if retrieval == KeyRetrieval::Returning {
                w.push(" RETURNING ").ident(meta.primary_key().column);
            }
            Some(retrieval)
        } else {
            None
        };

        Ok(InsertStatement {
            entity: meta.entity_name(),
            statement: w.finish(),
            key_retrieval,
        })
    }

    /// `SELECT` with filters, eager joins, ordering and paging.
    #[allow(clippy::result_large_err)]
    pub fn select(
        &self,
        registry: &Registry,
        meta: &EntityMetadata,
        spec: &QuerySpec,
    ) -> Result<SelectStatement> {
        let plan = FetchPlan::for_entity(meta, &spec.includes)?;
        let mut joined = Vec::with_capacity(plan.joins.len());
        for join in &plan.joins {
            let rel = relationship(meta, join.relationship)?;
            let target = registry.lookup_type(join.target, join.target_name)?;
            joined.push((rel, target, join.alias.as_str()));
        }

        let mut w = SqlWriter::new(self.dialect);
        w.push("SELECT ");
        eager::write_columns(&mut w, meta);
        for (_, target, alias) in &joined {
            eager::write_join_columns(&mut w, target, alias);
        }
        w.push(" FROM ").ident(meta.table());
        for (rel, target, alias) in &joined {
            eager::write_join(&mut w, meta, rel, target, alias);
        }
        self.write_where(&mut w, meta, spec)?;

        let paged = spec.limit.is_some() || spec.offset.is_some();
        if spec.sort.is_unsorted() && paged {
            let by_key = Sort::from(Order::asc(meta.primary_key().field));
            write_order(&mut w, meta, &by_key)?;
        } else {
            write_order(&mut w, meta, &spec.sort)?;
        }
        self.write_limit(&mut w, spec.limit, spec.offset);

        Ok(SelectStatement {
            statement: w.finish(),
            plan,
        })
    }

    /// `SELECT` of one entity by primary key, with its eager relationships joined.
    #[allow(clippy::result_large_err)]
    pub fn select_by_id(
        &self,
        registry: &Registry,
        meta: &EntityMetadata,
        id: Value,
    ) -> Result<SelectStatement> {
        let spec = QuerySpec::new().filter(Filter::eq(meta.primary_key().field, id));
        self.select(registry, meta, &spec)
    }

    /// `SELECT COUNT(*)` honouring only the filters of `spec`.
    #[allow(clippy::result_large_err)]
    pub fn count(&self, meta: &EntityMetadata, spec: &QuerySpec) -> Result<BoundStatement> {
        let mut w = SqlWriter::new(self.dialect);
        w.push("SELECT COUNT(*) FROM ").ident(meta.table());
        self.write_where(&mut w, meta, spec)?;
        Ok(w.finish())
    }

    /// Bulk `DELETE` honouring only the filters of `spec`.
    #[allow(clippy::result_large_err)]
    pub fn delete(&self, meta: &EntityMetadata, spec: &QuerySpec) -> Result<BoundStatement> {
        let mut w = SqlWriter::new(self.dialect);
        w.push("DELETE FROM ").ident(meta.table());
        self.write_where(&mut w, meta, spec)?;
        Ok(w.finish())
    }

    /// `UPDATE` of every non-key column, keyed by primary key.
    ///
    /// A null primary key is a `MissingKey` persistence error.
    #[allow(clippy::result_large_err)]
    pub fn update(&self, meta: &EntityMetadata, values: &[Value]) -> Result<BoundStatement> {
        check_arity(meta, values)?;
        let pk_index = meta.primary_key_index();
        let key = &values[pk_index];
        if key.is_null() {
            return Err(missing_key(meta, "update"));
        }

        let mut w = SqlWriter::new(self.dialect);
        w.push("UPDATE ").ident(meta.table()).push(" SET ");
        let mut first = true;
        for (i, (col, value)) in meta.columns().iter().zip(values).enumerate() {
            if i == pk_index || (col.generated && value.is_null()) {
                continue;
            }
            if !first {
                w.push(", ");
            }
            first = false;
            w.ident(col.column).push(" = ").bind(value.clone());
        }
        if first {
            // nothing but the key: touch the key so the statement still reports the row
            w.ident(meta.primary_key().column)
                .push(" = ")
                .ident(meta.primary_key().column);
        }
        w.push(" WHERE ")
            .ident(meta.primary_key().column)
            .push(" = ")
            .bind(key.clone());
        Ok(w.finish())
    }

    /// `DELETE` of one row by primary key.
    #[allow(clippy::result_large_err)]
    pub fn delete_by_id(&self, meta: &EntityMetadata, id: Value) -> Result<BoundStatement> {
        if id.is_null() {
            return Err(missing_key(meta, "delete"));
        }
        let mut w = SqlWriter::new(self.dialect);
        w.push("DELETE FROM ")
            .ident(meta.table())
            .push(" WHERE ")
            .ident(meta.primary_key().column)
            .push(" = ")
            .bind(id);
        Ok(w.finish())
    }

    /// Follow-up fetch of `rel` for a batch of owner keys.
    #[allow(clippy::result_large_err)]
    pub fn related(
        &self,
        registry: &Registry,
        rel: &RelationshipDef,
        keys: &[Value],
    ) -> Result<Option<RelatedFetch>> {
        eager::related_fetch(self.dialect, registry, rel, keys)
    }

    /// Link-table row associating `owner` with `target`.
    pub fn insert_link(&self, link: &LinkTable, owner: Value, target: Value) -> BoundStatement {
        let mut w = SqlWriter::new(self.dialect);
        w.push("INSERT INTO ")
            .ident(link.table)
            .push(" (")
            .ident(link.local_column)
            .push(", ")
            .ident(link.remote_column)
            .push(") VALUES ")
            .bind_list([owner, target]);
        w.finish()
    }

    /// Remove every link-table row of `owner`.
    pub fn delete_links(&self, link: &LinkTable, owner: Value) -> BoundStatement {
        let mut w = SqlWriter::new(self.dialect);
        w.push("DELETE FROM ")
            .ident(link.table)
            .push(" WHERE ")
            .ident(link.local_column)
            .push(" = ")
            .bind(owner);
        w.finish()
    }

    #[allow(clippy::result_large_err)]
    fn write_where(&self, w: &mut SqlWriter, meta: &EntityMetadata, spec: &QuerySpec) -> Result<()> {
        let groups = spec.groups();
        if groups.is_empty() {
            return Ok(());
        }
        w.push(" WHERE ");
        let parenthesize = groups.len() > 1;
        for (g, group) in groups.iter().enumerate() {
            if g > 0 {
                w.push(" OR ");
            }
            if parenthesize {
                w.push("(");
            }
            for (i, filter) in group.iter().enumerate() {
                if i > 0 {
                    w.push(" AND ");
                }
                write_filter(w, meta, filter)?;
            }
            if parenthesize {
                w.push(")");
            }
        }
        Ok(())
    }

    fn write_limit(&self, w: &mut SqlWriter, limit: Option<u64>, offset: Option<u64>) {
        match (limit, offset) {
            (None, None) => {}
            (Some(limit), None) => {
                w.push(" LIMIT ").bind(count_value(limit));
            }
            (Some(limit), Some(offset)) => {
                w.push(" LIMIT ")
                    .bind(count_value(limit))
                    .push(" OFFSET ")
                    .bind(count_value(offset));
            }
            (None, Some(offset)) => {
                // MySQL has no OFFSET without LIMIT
                if self.dialect == Dialect::Mysql {
                    w.push(" LIMIT 18446744073709551615");
                }
                w.push(" OFFSET ").bind(count_value(offset));
            }
        }
    }
}

/// Resolve a property (field or column name) to its column.
#[allow(clippy::result_large_err)]
pub(crate) fn resolve<'m>(meta: &'m EntityMetadata, property: &str) -> Result<&'m ColumnDef> {
    meta.column(property).ok_or_else(|| {
        Error::query(
            QueryErrorKind::UnknownColumn,
            format!("{} has no property '{}'", meta.entity_name(), property),
        )
    })
}

#[allow(clippy::result_large_err)]
fn relationship<'m>(meta: &'m EntityMetadata, name: &str) -> Result<&'m RelationshipDef> {
    meta.relationship(name).ok_or_else(|| {
        Error::query(
            QueryErrorKind::UnknownRelationship,
            format!("{} has no relationship '{}'", meta.entity_name(), name),
        )
    })
}

#[allow(clippy::result_large_err)]
fn write_filter(w: &mut SqlWriter, meta: &EntityMetadata, filter: &Filter) -> Result<()> {
    let col = resolve(meta, &filter.property)?.column;
    let table = meta.table();
    let fold = filter.ignore_case;

    let lhs = |w: &mut SqlWriter| {
        if fold {
            w.push("LOWER(").qualified(table, col).push(")");
        } else {
            w.qualified(table, col);
        }
    };
    let rhs = |w: &mut SqlWriter, value: Value| {
        if fold {
            w.push("LOWER(").bind(value).push(")");
        } else {
            w.bind(value);
        }
    };

    match (filter.comparator, &filter.operand) {
        (Comparator::Eq, Operand::One(Value::Null)) | (Comparator::IsNull, Operand::None) => {
            w.qualified(table, col).push(" IS NULL");
        }
        (Comparator::Ne, Operand::One(Value::Null)) | (Comparator::IsNotNull, Operand::None) => {
            w.qualified(table, col).push(" IS NOT NULL");
        }
        (Comparator::Like | Comparator::NotLike, Operand::One(value)) => {
            if !matches!(value, Value::Text(_)) {
                return Err(invalid_filter(filter, "pattern must be text"));
            }
            lhs(w);
            w.push(" ").push(filter.comparator.operator()).push(" ");
            rhs(w, value.clone());
        }
        (
            Comparator::Eq
            | Comparator::Ne
            | Comparator::Lt
            | Comparator::Le
            | Comparator::Gt
            | Comparator::Ge,
            Operand::One(value),
        ) => {
            lhs(w);
            w.push(" ").push(filter.comparator.operator()).push(" ");
            rhs(w, value.clone());
        }
        (Comparator::Between, Operand::Range(low, high)) => {
            if low.is_null() || high.is_null() {
                return Err(invalid_filter(filter, "range bounds cannot be null"));
            }
            lhs(w);
            w.push(" BETWEEN ");
            rhs(w, low.clone());
            w.push(" AND ");
            rhs(w, high.clone());
        }
        (Comparator::In | Comparator::NotIn, Operand::List(values)) => {
            if values.is_empty() {
                // x IN () is not valid SQL; an empty list matches nothing (or everything for NOT IN)
                w.push(if filter.comparator == Comparator::In {
                    "1 = 0"
                } else {
                    "1 = 1"
                });
                return Ok(());
            }
            lhs(w);
            w.push(" ").push(filter.comparator.operator()).push(" (");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                rhs(w, value.clone());
            }
            w.push(")");
        }
        _ => {
            return Err(invalid_filter(
                filter,
                "operand does not fit the comparator",
            ));
        }
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn write_order(w: &mut SqlWriter, meta: &EntityMetadata, sort: &Sort) -> Result<()> {
    for (i, order) in sort.orders().iter().enumerate() {
        let col = resolve(meta, &order.property)?.column;
        w.push(if i == 0 { " ORDER BY " } else { ", " })
            .qualified(meta.table(), col)
            .push(" ")
            .push(order.direction.as_sql());
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn check_arity(meta: &EntityMetadata, values: &[Value]) -> Result<()> {
    if values.len() == meta.columns().len() {
        Ok(())
    } else {
        Err(Error::mapping(
            meta.entity_name(),
            None,
            format!(
                "expected {} column values, got {}",
                meta.columns().len(),
                values.len()
            ),
        ))
    }
}

fn missing_key(meta: &EntityMetadata, operation: &str) -> Error {
    Error::Persistence(PersistenceError {
        kind: PersistenceErrorKind::MissingKey,
        code: None,
        message: format!(
            "cannot {} {} without a primary key value",
            operation,
            meta.entity_name()
        ),
        sql: None,
    })
}

fn invalid_filter(filter: &Filter, reason: &str) -> Error {
    Error::query(
        QueryErrorKind::InvalidFilter,
        format!(
            "{:?} filter on '{}': {}",
            filter.comparator, filter.property, reason
        ),
    )
}

fn count_value(n: u64) -> Value {
    Value::BigInt(i64::try_from(n).unwrap_or(i64::MAX))
}
