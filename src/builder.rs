use crate::backend::{ExecResult, Executor};
use crate::error::{QueryError, Result};
use crate::model::{FromRecord, Model, Record};
use crate::registry::EntityMeta;
use crate::relation;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

/// Comparison operators for WHERE clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    Regexp,
    IsNull,
    IsNotNull,
}

impl ComparisonOp {
    /// Whether the operator is followed by a bound value
    pub fn takes_value(&self) -> bool {
        !matches!(self, ComparisonOp::IsNull | ComparisonOp::IsNotNull)
    }
}

impl FromStr for ComparisonOp {
    type Err = QueryError;

    /// Parse an operator; case and inner whitespace are normalized.
    fn from_str(op: &str) -> Result<Self> {
        let normalized = op
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase();

        match normalized.as_str() {
            "=" => Ok(ComparisonOp::Eq),
            "!=" | "<>" => Ok(ComparisonOp::Ne),
            "<" => Ok(ComparisonOp::Lt),
            "<=" => Ok(ComparisonOp::Le),
            ">" => Ok(ComparisonOp::Gt),
            ">=" => Ok(ComparisonOp::Ge),
            "LIKE" => Ok(ComparisonOp::Like),
            "NOT LIKE" => Ok(ComparisonOp::NotLike),
            "REGEXP" => Ok(ComparisonOp::Regexp),
            "IS NULL" => Ok(ComparisonOp::IsNull),
            "IS NOT NULL" => Ok(ComparisonOp::IsNotNull),
            _ => Err(QueryError::Query(format!("unsupported operator: {}", op))),
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonOp::Eq => write!(f, "="),
            ComparisonOp::Ne => write!(f, "!="),
            ComparisonOp::Lt => write!(f, "<"),
            ComparisonOp::Le => write!(f, "<="),
            ComparisonOp::Gt => write!(f, ">"),
            ComparisonOp::Ge => write!(f, ">="),
            ComparisonOp::Like => write!(f, "LIKE"),
            ComparisonOp::NotLike => write!(f, "NOT LIKE"),
            ComparisonOp::Regexp => write!(f, "REGEXP"),
            ComparisonOp::IsNull => write!(f, "IS NULL"),
            ComparisonOp::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

/// Logical operators for combining conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => write!(f, "AND"),
            LogicalOp::Or => write!(f, "OR"),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl FromStr for SortDirection {
    type Err = QueryError;

    fn from_str(direction: &str) -> Result<Self> {
        match direction.trim().to_uppercase().as_str() {
            "ASC" => Ok(SortDirection::Asc),
            "DESC" => Ok(SortDirection::Desc),
            _ => Err(QueryError::Query(format!("unsupported sort direction: {}", direction))),
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// Join type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER JOIN"),
            JoinType::Left => write!(f, "LEFT JOIN"),
            JoinType::Right => write!(f, "RIGHT JOIN"),
        }
    }
}

/// Aggregate function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn to_sql(&self, column: &str) -> String {
        match self {
            AggregateFunc::Count => "COUNT(*)".to_string(),
            AggregateFunc::Sum => format!("SUM({})", column),
            AggregateFunc::Avg => format!("AVG({})", column),
            AggregateFunc::Min => format!("MIN({})", column),
            AggregateFunc::Max => format!("MAX({})", column),
        }
    }
}

/// One WHERE or HAVING predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Basic {
        column: String,
        op: ComparisonOp,
        value: Option<Value>,
        connector: LogicalOp,
    },
    Raw {
        sql: String,
        bindings: Vec<Value>,
        connector: LogicalOp,
    },
    In {
        column: String,
        values: Vec<Value>,
        negated: bool,
        connector: LogicalOp,
    },
}

impl Predicate {
    pub fn connector(&self) -> LogicalOp {
        match self {
            Predicate::Basic { connector, .. }
            | Predicate::Raw { connector, .. }
            | Predicate::In { connector, .. } => *connector,
        }
    }

    /// Compile to SQL, appending this predicate's bindings in placeholder order.
    pub fn compile(&self, bindings: &mut Vec<Value>) -> String {
        match self {
            Predicate::Basic { column, op, value, .. } => {
                if op.takes_value() {
                    bindings.push(value.clone().unwrap_or(Value::Null));
                    format!("{} {} ?", column, op)
                } else {
                    format!("{} {}", column, op)
                }
            }
            Predicate::Raw { sql, bindings: own, .. } => {
                bindings.extend(own.iter().cloned());
                sql.clone()
            }
            Predicate::In { column, values, negated, .. } => {
                if values.is_empty() {
                    // IN () is invalid SQL
                    return if *negated { "1 = 1" } else { "0 = 1" }.to_string();
                }
                bindings.extend(values.iter().cloned());
                let placeholders = vec!["?"; values.len()].join(", ");
                let keyword = if *negated { "NOT IN" } else { "IN" };
                format!("{} {} ({})", column, keyword, placeholders)
            }
        }
    }
}

fn compile_predicates(predicates: &[Predicate], bindings: &mut Vec<Value>) -> String {
    let mut sql = String::new();
    for (idx, predicate) in predicates.iter().enumerate() {
        if idx > 0 {
            sql.push_str(&format!(" {} ", predicate.connector()));
        }
        sql.push_str(&predicate.compile(bindings));
    }
    sql
}

/// Join clause
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: String,
    pub first: String,
    pub op: ComparisonOp,
    pub second: String,
}

impl Join {
    pub fn to_sql(&self) -> String {
        format!(
            "{} {} ON {} {} {}",
            self.join_type, self.table, self.first, self.op, self.second
        )
    }
}

/// ORDER BY clause
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn to_sql(&self) -> String {
        format!("{} {}", self.column, self.direction)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Selection {
    Column(String),
    Raw { sql: String, bindings: Vec<Value> },
}

/// One page of results
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub per_page: u64,
    pub page: u64,
    pub last_page: u64,
}

/// Typed query over entity `E`
pub type Query<E> = QueryBuilder<Model<E>>;

/// SELECT statement accumulator bound to one entity's table.
///
/// Chaining methods never fail; malformed input (an unknown operator, say)
/// is remembered and reported by the next compile or terminal call.
/// `get`, `first`, `find` and `paginate` consume the builder. Aggregates and
/// bulk writes borrow it and leave its state untouched.
pub struct QueryBuilder<T = Record> {
    meta: &'static EntityMeta,
    table: String,
    distinct: bool,
    columns: Vec<Selection>,
    joins: Vec<Join>,
    wheres: Vec<Predicate>,
    group_by: Vec<String>,
    havings: Vec<Predicate>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    eager: Vec<String>,
    error: Option<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for QueryBuilder<T> {
    fn clone(&self) -> Self {
        Self {
            meta: self.meta,
            table: self.table.clone(),
            distinct: self.distinct,
            columns: self.columns.clone(),
            joins: self.joins.clone(),
            wheres: self.wheres.clone(),
            group_by: self.group_by.clone(),
            havings: self.havings.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
            eager: self.eager.clone(),
            error: self.error.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for QueryBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("table", &self.table)
            .field("wheres", &self.wheres)
            .field("eager", &self.eager)
            .finish_non_exhaustive()
    }
}

impl<T> QueryBuilder<T> {
    /// Create a builder for a described entity
    pub fn for_entity(meta: &'static EntityMeta) -> Result<Self> {
        let table = meta.require_table()?.to_string();
        Ok(Self {
            meta,
            table,
            distinct: false,
            columns: Vec::new(),
            joins: Vec::new(),
            wheres: Vec::new(),
            group_by: Vec::new(),
            havings: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            eager: Vec::new(),
            error: None,
            _marker: PhantomData,
        })
    }

    pub fn meta(&self) -> &'static EntityMeta {
        self.meta
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Relations requested for eager loading
    pub fn eager_loads(&self) -> &[String] {
        &self.eager
    }

    /// Same query state hydrating into another row type
    pub(crate) fn cast<U>(self) -> QueryBuilder<U> {
        QueryBuilder {
            meta: self.meta,
            table: self.table,
            distinct: self.distinct,
            columns: self.columns,
            joins: self.joins,
            wheres: self.wheres,
            group_by: self.group_by,
            havings: self.havings,
            order_by: self.order_by,
            limit: self.limit,
            offset: self.offset,
            eager: self.eager,
            error: self.error,
            _marker: PhantomData,
        }
    }

    fn fail(&mut self, err: QueryError) {
        if self.error.is_none() {
            self.error = Some(err.to_string());
        }
    }

    fn parse_op(&mut self, op: &str) -> ComparisonOp {
        match op.parse() {
            Ok(op) => op,
            Err(e) => {
                self.fail(e);
                ComparisonOp::Eq
            }
        }
    }

    /// Select specific columns, replacing earlier column selections
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.retain(|s| matches!(s, Selection::Raw { .. }));
        self.columns
            .extend(columns.into_iter().map(|c| Selection::Column(c.into())));
        self
    }

    /// Add a column to select
    pub fn add_column(mut self, column: impl Into<String>) -> Self {
        self.columns.push(Selection::Column(column.into()));
        self
    }

    /// Add a raw select expression with its own bindings
    pub fn select_raw(mut self, sql: impl Into<String>, bindings: Vec<Value>) -> Self {
        self.columns.push(Selection::Raw {
            sql: sql.into(),
            bindings,
        });
        self
    }

    /// Use DISTINCT
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    fn push_basic(mut self, column: String, op: &str, value: Value, connector: LogicalOp) -> Self {
        let op = self.parse_op(op);
        let value = op.takes_value().then_some(value);
        self.wheres.push(Predicate::Basic {
            column,
            op,
            value,
            connector,
        });
        self
    }

    /// Add `column <op> ?`; `IS NULL` and `IS NOT NULL` ignore the value
    pub fn where_op(self, column: impl Into<String>, op: &str, value: impl Into<Value>) -> Self {
        self.push_basic(column.into(), op, value.into(), LogicalOp::And)
    }

    pub fn or_where_op(self, column: impl Into<String>, op: &str, value: impl Into<Value>) -> Self {
        self.push_basic(column.into(), op, value.into(), LogicalOp::Or)
    }

    /// Add a simple WHERE condition (column = value)
    pub fn where_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_op(column, "=", value)
    }

    pub fn or_where_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.or_where_op(column, "=", value)
    }

    /// Add a WHERE column IS NULL condition
    pub fn where_null(self, column: impl Into<String>) -> Self {
        self.where_op(column, "IS NULL", Value::Null)
    }

    pub fn where_not_null(self, column: impl Into<String>) -> Self {
        self.where_op(column, "IS NOT NULL", Value::Null)
    }

    /// Add a literal predicate with its own bindings
    pub fn where_raw(mut self, sql: impl Into<String>, bindings: Vec<Value>) -> Self {
        self.wheres.push(Predicate::Raw {
            sql: sql.into(),
            bindings,
            connector: LogicalOp::And,
        });
        self
    }

    pub fn or_where_raw(mut self, sql: impl Into<String>, bindings: Vec<Value>) -> Self {
        self.wheres.push(Predicate::Raw {
            sql: sql.into(),
            bindings,
            connector: LogicalOp::Or,
        });
        self
    }

    fn push_in<I, V>(mut self, column: String, values: I, negated: bool, connector: LogicalOp) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.wheres.push(Predicate::In {
            column,
            values: values.into_iter().map(Into::into).collect(),
            negated,
            connector,
        });
        self
    }

    /// Add a WHERE column IN (...) condition; an empty list matches nothing
    pub fn where_in<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_in(column.into(), values, false, LogicalOp::And)
    }

    /// WHERE column NOT IN (...); an empty list matches everything
    pub fn where_not_in<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_in(column.into(), values, true, LogicalOp::And)
    }

    pub fn or_where_in<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_in(column.into(), values, false, LogicalOp::Or)
    }

    pub fn or_where_not_in<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_in(column.into(), values, true, LogicalOp::Or)
    }

    fn push_join(
        mut self,
        join_type: JoinType,
        table: impl Into<String>,
        first: impl Into<String>,
        op: &str,
        second: impl Into<String>,
    ) -> Self {
        let op = self.parse_op(op);
        self.joins.push(Join {
            join_type,
            table: table.into(),
            first: first.into(),
            op,
            second: second.into(),
        });
        self
    }

    /// Add an INNER JOIN
    pub fn join(
        self,
        table: impl Into<String>,
        first: impl Into<String>,
        op: &str,
        second: impl Into<String>,
    ) -> Self {
        self.push_join(JoinType::Inner, table, first, op, second)
    }

    /// Add a LEFT JOIN
    pub fn left_join(
        self,
        table: impl Into<String>,
        first: impl Into<String>,
        op: &str,
        second: impl Into<String>,
    ) -> Self {
        self.push_join(JoinType::Left, table, first, op, second)
    }

    pub fn right_join(
        self,
        table: impl Into<String>,
        first: impl Into<String>,
        op: &str,
        second: impl Into<String>,
    ) -> Self {
        self.push_join(JoinType::Right, table, first, op, second)
    }

    /// Add GROUP BY columns
    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Add a HAVING condition
    pub fn having(mut self, column: impl Into<String>, op: &str, value: impl Into<Value>) -> Self {
        let op = self.parse_op(op);
        let value = op.takes_value().then(|| value.into());
        self.havings.push(Predicate::Basic {
            column: column.into(),
            op,
            value,
            connector: LogicalOp::And,
        });
        self
    }

    pub fn having_raw(mut self, sql: impl Into<String>, bindings: Vec<Value>) -> Self {
        self.havings.push(Predicate::Raw {
            sql: sql.into(),
            bindings,
            connector: LogicalOp::And,
        });
        self
    }

    /// Add ORDER BY; the direction is `ASC` or `DESC` in any case
    pub fn order_by(mut self, column: impl Into<String>, direction: &str) -> Self {
        let direction = match direction.parse() {
            Ok(direction) => direction,
            Err(e) => {
                self.fail(e);
                SortDirection::Asc
            }
        };
        self.order_by.push(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }

    /// Add ascending ORDER BY
    pub fn order_asc(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            direction: SortDirection::Asc,
        });
        self
    }

    /// Add descending ORDER BY
    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            direction: SortDirection::Desc,
        });
        self
    }

    pub fn latest(self, column: impl Into<String>) -> Self {
        self.order_desc(column)
    }

    pub fn oldest(self, column: impl Into<String>) -> Self {
        self.order_asc(column)
    }

    /// Set LIMIT
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set OFFSET
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Request eager loading; dot paths such as `roles.permissions` nest.
    pub fn with<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for relation in relations {
            let relation = relation.into();
            if !self.eager.contains(&relation) {
                self.eager.push(relation);
            }
        }
        self
    }

    fn check(&self) -> Result<()> {
        match &self.error {
            Some(message) => Err(QueryError::Query(message.clone())),
            None => Ok(()),
        }
    }

    fn key_column(&self) -> Result<String> {
        let key = &self.meta.require_primary_key()?.db_name;
        if self.joins.is_empty() {
            Ok(key.clone())
        } else {
            Ok(format!("{}.{}", self.table, key))
        }
    }

    fn compile_where(&self, sql: &mut String, bindings: &mut Vec<Value>) {
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&compile_predicates(&self.wheres, bindings));
        }
    }

    fn compile_select(&self, bindings: &mut Vec<Value>) -> String {
        let mut sql = String::from("SELECT ");

        if self.distinct {
            sql.push_str("DISTINCT ");
        }

        if self.columns.is_empty() {
            if self.joins.is_empty() {
                sql.push('*');
            } else {
                sql.push_str(&format!("{}.*", self.table));
            }
        } else {
            let columns: Vec<String> = self
                .columns
                .iter()
                .map(|selection| match selection {
                    Selection::Column(column) => column.clone(),
                    Selection::Raw { sql, bindings: own } => {
                        bindings.extend(own.iter().cloned());
                        sql.clone()
                    }
                })
                .collect();
            sql.push_str(&columns.join(", "));
        }

        sql.push_str(&format!(" FROM {}", self.table));

        for join in &self.joins {
            sql.push(' ');
            sql.push_str(&join.to_sql());
        }

        self.compile_where(&mut sql, bindings);

        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }

        if !self.havings.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&compile_predicates(&self.havings, bindings));
        }

        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(
                &self
                    .order_by
                    .iter()
                    .map(|o| o.to_sql())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        sql
    }

    /// Compile to SQL text and positional bindings
    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        self.check()?;
        let mut bindings = Vec::new();
        let sql = self.compile_select(&mut bindings);
        Ok((sql, bindings))
    }

    /// Run the query and hydrate raw records, resolving eager loads.
    pub(crate) fn get_records(self, db: &mut dyn Executor) -> Result<Vec<Record>> {
        let (sql, bindings) = self.to_sql()?;
        tracing::debug!(sql = %sql, bindings = bindings.len(), "executing query");

        let rows = db.query(&sql, &bindings)?;
        let mut records: Vec<Record> = rows
            .into_iter()
            .map(|row| Record::from_row(self.meta, row))
            .collect();

        if !self.eager.is_empty() && !records.is_empty() {
            relation::eager_load(db, &mut records, &self.eager)?;
        }

        Ok(records)
    }

    fn aggregate_query(&self, func: AggregateFunc, column: &str) -> Result<(String, Vec<Value>)> {
        self.check()?;

        let mut inner = self.clone();
        inner.order_by.clear();
        inner.limit = None;
        inner.offset = None;
        inner.eager.clear();

        let mut bindings = Vec::new();
        if func == AggregateFunc::Count && (inner.distinct || !inner.group_by.is_empty()) {
            let inner_sql = inner.compile_select(&mut bindings);
            let sql = format!(
                "SELECT COUNT(*) AS aggregate FROM ({}) AS aggregate_table",
                inner_sql
            );
            return Ok((sql, bindings));
        }

        inner.distinct = false;
        inner.columns = vec![Selection::Raw {
            sql: format!("{} AS aggregate", func.to_sql(column)),
            bindings: Vec::new(),
        }];
        Ok((inner.compile_select(&mut bindings), bindings))
    }

    /// Run an aggregate over a copy of the current state.
    pub fn aggregate(&self, db: &mut dyn Executor, func: AggregateFunc, column: &str) -> Result<Value> {
        let (sql, bindings) = self.aggregate_query(func, column)?;
        tracing::debug!(sql = %sql, bindings = bindings.len(), "executing aggregate");

        let rows = db.query(&sql, &bindings)?;
        Ok(rows
            .first()
            .and_then(|row| row.value_ci("aggregate"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub fn count(&self, db: &mut dyn Executor) -> Result<u64> {
        let value = self.aggregate(db, AggregateFunc::Count, "*")?;
        Ok(value_as_f64(&value).map(|n| n as u64).unwrap_or(0))
    }

    pub fn sum(&self, db: &mut dyn Executor, column: &str) -> Result<Option<f64>> {
        Ok(value_as_f64(&self.aggregate(db, AggregateFunc::Sum, column)?))
    }

    pub fn avg(&self, db: &mut dyn Executor, column: &str) -> Result<Option<f64>> {
        Ok(value_as_f64(&self.aggregate(db, AggregateFunc::Avg, column)?))
    }

    pub fn min(&self, db: &mut dyn Executor, column: &str) -> Result<Value> {
        self.aggregate(db, AggregateFunc::Min, column)
    }

    pub fn max(&self, db: &mut dyn Executor, column: &str) -> Result<Value> {
        self.aggregate(db, AggregateFunc::Max, column)
    }

    pub fn exists(&self, db: &mut dyn Executor) -> Result<bool> {
        Ok(self.count(db)? > 0)
    }

    /// Values of one column across the matching rows
    pub fn pluck(&self, db: &mut dyn Executor, column: &str) -> Result<Vec<Value>> {
        let mut query = self.clone().select([column]);
        query.columns.retain(|s| matches!(s, Selection::Column(_)));
        query.eager.clear();

        let (sql, bindings) = query.to_sql()?;
        let rows = db.query(&sql, &bindings)?;
        let key = column.rsplit('.').next().unwrap_or(column);
        Ok(rows
            .iter()
            .map(|row| row.value_ci(key).cloned().unwrap_or(Value::Null))
            .collect())
    }

    /// INSERT one row into the builder's table
    pub fn insert<I, K>(&self, db: &mut dyn Executor, values: I) -> Result<ExecResult>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let (columns, bindings): (Vec<String>, Vec<Value>) =
            values.into_iter().map(|(k, v)| (k.into(), v)).unzip();

        if columns.is_empty() {
            return Err(QueryError::Query("INSERT must have at least one value".to_string()));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        );
        tracing::debug!(sql = %sql, bindings = bindings.len(), "executing insert");
        db.execute(&sql, &bindings)
    }

    /// UPDATE the rows matched by the current predicates
    pub fn update<I, K>(&self, db: &mut dyn Executor, values: I) -> Result<u64>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.check()?;

        let mut bindings = Vec::new();
        let set_clauses: Vec<String> = values
            .into_iter()
            .map(|(column, value)| {
                bindings.push(value);
                format!("{} = ?", column.into())
            })
            .collect();

        if set_clauses.is_empty() {
            return Err(QueryError::Query("UPDATE must have at least one SET value".to_string()));
        }

        let mut sql = format!("UPDATE {} SET {}", self.table, set_clauses.join(", "));
        self.compile_where(&mut sql, &mut bindings);

        tracing::debug!(sql = %sql, bindings = bindings.len(), "executing update");
        Ok(db.execute(&sql, &bindings)?.rows_affected)
    }

    /// DELETE the rows matched by the current predicates
    pub fn delete(&self, db: &mut dyn Executor) -> Result<u64> {
        self.check()?;

        let mut bindings = Vec::new();
        let mut sql = format!("DELETE FROM {}", self.table);
        self.compile_where(&mut sql, &mut bindings);

        tracing::debug!(sql = %sql, bindings = bindings.len(), "executing delete");
        Ok(db.execute(&sql, &bindings)?.rows_affected)
    }
}

impl<T: FromRecord> QueryBuilder<T> {
    /// Execute and hydrate every row
    pub fn get(self, db: &mut dyn Executor) -> Result<Vec<T>> {
        self.get_records(db)?
            .into_iter()
            .map(T::from_record)
            .collect()
    }

    /// Execute with an implicit LIMIT 1
    pub fn first(self, db: &mut dyn Executor) -> Result<Option<T>> {
        Ok(self.limit(1).get(db)?.into_iter().next())
    }

    /// Row with the given primary key, if any
    pub fn find(self, db: &mut dyn Executor, id: impl Into<Value>) -> Result<Option<T>> {
        let key = self.key_column()?;
        self.where_eq(key, id).first(db)
    }

    /// Like `find`, failing with `NotFound` when no row matches
    pub fn find_or_fail(self, db: &mut dyn Executor, id: impl Into<Value>) -> Result<T> {
        let id = id.into();
        let table = self.table.clone();
        self.find(db, id.clone())?.ok_or_else(|| QueryError::NotFound {
            table,
            key: match &id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        })
    }

    /// Count query plus limited item query over the same predicates
    pub fn paginate(self, db: &mut dyn Executor, per_page: u64, page: u64) -> Result<Page<T>> {
        let per_page = per_page.max(1);
        let page = page.max(1);
        let offset = (page - 1).checked_mul(per_page).ok_or_else(|| {
            QueryError::Query(format!("page {} of {} rows is out of range", page, per_page))
        })?;

        let total = self.count(db)?;
        let items = self.clone().limit(per_page).offset(offset).get(db)?;

        Ok(Page {
            items,
            total,
            per_page,
            page,
            last_page: total.div_ceil(per_page).max(1),
        })
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
