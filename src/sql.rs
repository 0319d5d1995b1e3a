use std::ops::ControlFlow;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, BinaryOperator, Expr, ObjectNamePart, SelectItem, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Relations visible to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Rooms,
    Reservations,
    AvailableRooms,
}

impl Relation {
    fn from_table(name: &str) -> Option<Self> {
        match name {
            "rooms" => Some(Relation::Rooms),
            "reservations" => Some(Relation::Reservations),
            "available_rooms" => Some(Relation::AvailableRooms),
            _ => None,
        }
    }
}

const ROOM_COLUMNS: &[&str] = &["id", "num_beds", "allow_smoking", "daily_rate", "cleaning_fee"];
const RESERVATION_INSERT_COLUMNS: &[&str] = &["room_id", "checkin_date", "checkout_date", "total_charge"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRooms {
        rooms: Vec<Room>,
    },
    InsertReservation {
        room_id: String,
        checkin: NaiveDate,
        checkout: NaiveDate,
        /// `None` means quote from the room's rates.
        total_charge: Option<Decimal>,
        returning: bool,
    },
    SelectAvailableRooms {
        start: NaiveDate,
        end: NaiveDate,
        min_beds: u32,
        allow_smoking: bool,
    },
    SelectReservations {
        id: Option<Ulid>,
        filter: ReservationFilter,
    },
    SelectRooms {
        id: Option<String>,
    },
}

/// Parse a single statement with no bound parameters.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    parse_sql_with_params(sql, &[])
}

/// Parse a single statement, binding `$N` to `params[N - 1]` (text format, `None` is NULL).
/// Parameters are substituted as values after parsing and never reach the SQL text.
pub fn parse_sql_with_params(sql: &str, params: &[Option<String>]) -> Result<Command, SqlError> {
    let mut stmts = parse_statements(sql)?;
    match stmts.len() {
        0 => Err(SqlError::Empty),
        1 => statement_to_command(&stmts.remove(0), &Binder { params }),
        n => Err(SqlError::Unsupported(format!("{n} statements in one prepared query"))),
    }
}

/// Parse a simple-query string that may hold several `;`-separated statements.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let binder = Binder { params: &[] };
    parse_statements(sql)?
        .iter()
        .map(|stmt| statement_to_command(stmt, &binder))
        .collect()
}

/// Relation whose columns a statement returns, if it returns rows at all.
pub fn statement_relation(sql: &str) -> Option<Relation> {
    let stmts = parse_statements(sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) if insert.returning.is_some() => {
            Relation::from_table(&insert_table_name(insert).ok()?)
        }
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => {
                let table = table_factor_name(&select.from.first()?.relation).ok()?;
                Relation::from_table(&table)
            }
            _ => None,
        },
        _ => None,
    }
}

/// Highest `$N` placeholder used by the statement, 0 if none or unparseable.
pub fn parameter_count(sql: &str) -> usize {
    let Ok(stmts) = parse_statements(sql) else {
        return 0;
    };
    let mut max = 0usize;
    let _ = ast::visit_expressions(&stmts, |expr| {
        if let Expr::Value(ValueWithSpan {
            value: Value::Placeholder(p),
            ..
        }) = expr
            && let Some(n) = p.strip_prefix('$').and_then(|d| d.parse::<usize>().ok())
        {
            max = max.max(n);
        }
        ControlFlow::<()>::Continue(())
    });
    max
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong(sql.len()));
    }
    let dialect = PostgreSqlDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))
}

fn statement_to_command(stmt: &Statement, binder: &Binder<'_>) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert, binder),
        Statement::Query(query) => parse_select(query, binder),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert, binder: &Binder<'_>) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let relation = Relation::from_table(&table).ok_or(SqlError::UnknownTable(table))?;
    let returning = returning_all(insert)?;
    let rows = extract_insert_rows(insert)?;

    match relation {
        Relation::Rooms => {
            if returning {
                return Err(SqlError::Unsupported("RETURNING on rooms".into()));
            }
            let rooms = rows
                .iter()
                .map(|row| {
                    let columns = insert_columns(insert, ROOM_COLUMNS, "rooms", row.len())?;
                    room_from_row(&columns, row, binder)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Command::InsertRooms { rooms })
        }
        Relation::Reservations => {
            let [row] = rows else {
                return Err(SqlError::Unsupported("multi-row INSERT INTO reservations".into()));
            };
            let columns = insert_columns(insert, RESERVATION_INSERT_COLUMNS, "reservations", row.len())?;
            reservation_from_row(&columns, row, binder, returning)
        }
        Relation::AvailableRooms => Err(SqlError::Unsupported("available_rooms is read-only".into())),
    }
}

fn room_from_row(columns: &[String], row: &[Expr], binder: &Binder<'_>) -> Result<Room, SqlError> {
    let (mut id, mut daily_rate, mut cleaning_fee) = (None, None, None);
    let (mut num_beds, mut allow_smoking) = (1u32, false);

    for (column, expr) in columns.iter().zip(row) {
        let value = binder.scalar(expr)?;
        match column.as_str() {
            "id" => id = Some(value.text("id")?),
            "num_beds" => {
                if let Some(v) = value.optional() {
                    num_beds = v.count("num_beds")?;
                }
            }
            "allow_smoking" => {
                if let Some(v) = value.optional() {
                    allow_smoking = v.boolean("allow_smoking")?;
                }
            }
            "daily_rate" => daily_rate = Some(value.decimal("daily_rate")?),
            "cleaning_fee" => cleaning_fee = Some(value.decimal("cleaning_fee")?),
            other => return Err(unknown_column("rooms", other)),
        }
    }

    Ok(Room {
        id: id.ok_or(SqlError::MissingColumn("id"))?,
        num_beds,
        allow_smoking,
        daily_rate: daily_rate.ok_or(SqlError::MissingColumn("daily_rate"))?,
        cleaning_fee: cleaning_fee.ok_or(SqlError::MissingColumn("cleaning_fee"))?,
    })
}

fn reservation_from_row(
    columns: &[String],
    row: &[Expr],
    binder: &Binder<'_>,
    returning: bool,
) -> Result<Command, SqlError> {
    let (mut room_id, mut checkin, mut checkout, mut total_charge) = (None, None, None, None);

    for (column, expr) in columns.iter().zip(row) {
        let value = binder.scalar(expr)?;
        match column.as_str() {
            "room_id" => room_id = Some(value.text("room_id")?),
            "checkin_date" => checkin = Some(value.date("checkin_date")?),
            "checkout_date" => checkout = Some(value.date("checkout_date")?),
            "total_charge" => {
                total_charge = value.optional().map(|v| v.decimal("total_charge")).transpose()?;
            }
            other => return Err(unknown_column("reservations", other)),
        }
    }

    Ok(Command::InsertReservation {
        room_id: room_id.ok_or(SqlError::MissingColumn("room_id"))?,
        checkin: checkin.ok_or(SqlError::MissingColumn("checkin_date"))?,
        checkout: checkout.ok_or(SqlError::MissingColumn("checkout_date"))?,
        total_charge,
        returning,
    })
}

fn parse_select(query: &ast::Query, binder: &Binder<'_>) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    if query.order_by.is_some() {
        return Err(SqlError::Unsupported("ORDER BY".into()));
    }
    if query.limit_clause.is_some() || query.fetch.is_some() {
        return Err(SqlError::Unsupported("LIMIT/OFFSET/FETCH".into()));
    }
    if select.distinct.is_some() {
        return Err(SqlError::Unsupported("DISTINCT".into()));
    }

    let [from] = select.from.as_slice() else {
        return Err(SqlError::Parse("expected exactly one table in FROM".into()));
    };
    if !from.joins.is_empty() {
        return Err(SqlError::Unsupported("JOIN".into()));
    }
    if !select.projection.iter().all(|item| matches!(item, SelectItem::Wildcard(_))) {
        return Err(SqlError::Unsupported("only SELECT * is supported".into()));
    }
    let table = table_factor_name(&from.relation)?;
    let relation = Relation::from_table(&table).ok_or(SqlError::UnknownTable(table))?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match relation {
        Relation::AvailableRooms => select_available_rooms(&filters, binder),
        Relation::Reservations => select_reservations(&filters, binder),
        Relation::Rooms => select_rooms(&filters, binder),
    }
}

fn select_available_rooms(filters: &[Filter<'_>], binder: &Binder<'_>) -> Result<Command, SqlError> {
    let (mut start, mut end, mut min_beds, mut allow_smoking) = (None, None, None, None);
    for f in filters {
        let value = binder.scalar(f.value)?;
        match (f.column.as_str(), f.op) {
            ("start_date", BinaryOperator::Eq) => start = Some(value.date("start_date")?),
            ("end_date", BinaryOperator::Eq) => end = Some(value.date("end_date")?),
            ("num_beds", BinaryOperator::GtEq) => min_beds = Some(value.count("num_beds")?),
            ("allow_smoking", BinaryOperator::Eq) => allow_smoking = Some(value.boolean("allow_smoking")?),
            _ => return Err(f.unsupported("available_rooms")),
        }
    }
    Ok(Command::SelectAvailableRooms {
        start: start.ok_or(SqlError::MissingFilter("start_date"))?,
        end: end.ok_or(SqlError::MissingFilter("end_date"))?,
        min_beds: min_beds.unwrap_or(1),
        allow_smoking: allow_smoking.unwrap_or(false),
    })
}

fn select_reservations(filters: &[Filter<'_>], binder: &Binder<'_>) -> Result<Command, SqlError> {
    let mut id = None;
    let mut filter = ReservationFilter::default();
    for f in filters {
        if f.op != &BinaryOperator::Eq {
            return Err(f.unsupported("reservations"));
        }
        let value = binder.scalar(f.value)?;
        match f.column.as_str() {
            "id" => id = Some(value.ulid("id")?),
            "room_id" => filter.room_id = Some(value.text("room_id")?),
            "checkin_date" => filter.checkin = Some(value.date("checkin_date")?),
            "checkout_date" => filter.checkout = Some(value.date("checkout_date")?),
            _ => return Err(f.unsupported("reservations")),
        }
    }
    Ok(Command::SelectReservations { id, filter })
}

fn select_rooms(filters: &[Filter<'_>], binder: &Binder<'_>) -> Result<Command, SqlError> {
    let mut id = None;
    for f in filters {
        match (f.column.as_str(), f.op) {
            ("id", BinaryOperator::Eq) => id = Some(binder.scalar(f.value)?.text("id")?),
            _ => return Err(f.unsupported("rooms")),
        }
    }
    Ok(Command::SelectRooms { id })
}

// ── WHERE clause ──────────────────────────────────────────────

/// One `column <op> value` term of a conjunctive WHERE clause.
struct Filter<'e> {
    column: String,
    op: &'e BinaryOperator,
    value: &'e Expr,
}

impl Filter<'_> {
    fn unsupported(&self, table: &str) -> SqlError {
        SqlError::UnsupportedFilter(format!("{} {} on {table}", self.column, self.op))
    }
}

fn collect_filters<'e>(expr: &'e Expr, out: &mut Vec<Filter<'e>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left).ok_or_else(|| SqlError::UnsupportedFilter(expr.to_string()))?;
            out.push(Filter {
                column,
                op,
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::UnsupportedFilter(other.to_string())),
    }
}

// ── Parameter binding ─────────────────────────────────────────

struct Binder<'p> {
    params: &'p [Option<String>],
}

/// A literal or bound parameter, before it is read as a column type.
#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Null,
    Text(String),
    Number(String),
    Bool(bool),
}

impl Binder<'_> {
    fn scalar(&self, expr: &Expr) -> Result<Scalar, SqlError> {
        match expr {
            Expr::Value(ValueWithSpan { value, .. }) => match value {
                Value::Placeholder(p) => self.param(p),
                Value::SingleQuotedString(s) => Ok(Scalar::Text(s.clone())),
                Value::Number(n, _) => Ok(Scalar::Number(n.clone())),
                Value::Boolean(b) => Ok(Scalar::Bool(*b)),
                Value::Null => Ok(Scalar::Null),
                other => Err(SqlError::Unsupported(format!("literal {other}"))),
            },
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } => match self.scalar(expr)? {
                Scalar::Number(n) => Ok(Scalar::Number(format!("-{n}"))),
                _ => Err(SqlError::Unsupported(format!("expression {expr}"))),
            },
            // '2023-03-01'::date and $1::numeric carry their value unchanged
            Expr::Cast { expr, .. } | Expr::Nested(expr) => self.scalar(expr),
            other => Err(SqlError::Unsupported(format!("expression {other}"))),
        }
    }

    fn param(&self, placeholder: &str) -> Result<Scalar, SqlError> {
        let n: usize = placeholder
            .strip_prefix('$')
            .and_then(|d| d.parse().ok())
            .ok_or_else(|| SqlError::Parse(format!("bad placeholder {placeholder}")))?;
        match n.checked_sub(1).and_then(|i| self.params.get(i)) {
            Some(Some(text)) => Ok(Scalar::Text(text.clone())),
            Some(None) => Ok(Scalar::Null),
            None => Err(SqlError::MissingParameter(n)),
        }
    }
}

impl Scalar {
    fn optional(self) -> Option<Scalar> {
        match self {
            Scalar::Null => None,
            v => Some(v),
        }
    }

    fn raw(self, column: &'static str) -> Result<String, SqlError> {
        match self {
            Scalar::Text(s) | Scalar::Number(s) => Ok(s),
            Scalar::Bool(b) => Ok(b.to_string()),
            Scalar::Null => Err(bad_value(column, "must not be NULL")),
        }
    }

    fn text(self, column: &'static str) -> Result<String, SqlError> {
        self.raw(column)
    }

    fn date(self, column: &'static str) -> Result<NaiveDate, SqlError> {
        let s = self.raw(column)?;
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| bad_value(column, format!("{s:?}: {e}")))
    }

    fn count(self, column: &'static str) -> Result<u32, SqlError> {
        let s = self.raw(column)?;
        s.trim().parse().map_err(|e| bad_value(column, format!("{s:?}: {e}")))
    }

    fn boolean(self, column: &'static str) -> Result<bool, SqlError> {
        if let Scalar::Bool(b) = self {
            return Ok(b);
        }
        let s = self.raw(column)?;
        match s.trim().to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(bad_value(column, format!("{s:?} is not a boolean"))),
        }
    }

    fn decimal(self, column: &'static str) -> Result<Decimal, SqlError> {
        let s = self.raw(column)?;
        let s = s.trim();
        s.parse::<Decimal>()
            .or_else(|_| Decimal::from_scientific(s))
            .map_err(|e| bad_value(column, format!("{s:?}: {e}")))
    }

    fn ulid(self, column: &'static str) -> Result<Ulid, SqlError> {
        let s = self.raw(column)?;
        Ulid::from_string(s.trim()).map_err(|e| bad_value(column, format!("{s:?}: {e}")))
    }
}

fn bad_value(column: &'static str, reason: impl Into<String>) -> SqlError {
    SqlError::BadValue {
        column,
        reason: reason.into(),
    }
}

fn unknown_column(table: &'static str, column: &str) -> SqlError {
    SqlError::UnknownColumn {
        table,
        column: column.to_string(),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// `RETURNING *` is the only projection accepted.
fn returning_all(insert: &ast::Insert) -> Result<bool, SqlError> {
    match &insert.returning {
        None => Ok(false),
        Some(items) if items.iter().all(|item| matches!(item, SelectItem::Wildcard(_))) => Ok(true),
        Some(_) => Err(SqlError::Unsupported("RETURNING supports * only".into())),
    }
}

/// Column names for one VALUES row: the explicit list, or a prefix of `defaults`.
fn insert_columns(
    insert: &ast::Insert,
    defaults: &[&str],
    table: &'static str,
    row_len: usize,
) -> Result<Vec<String>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        if row_len > defaults.len() {
            return Err(SqlError::WrongArity(table, defaults.len(), row_len));
        }
        defaults[..row_len].iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != row_len {
        return Err(SqlError::WrongArity(table, columns.len(), row_len));
    }
    for (i, c) in columns.iter().enumerate() {
        if columns[..i].contains(c) {
            return Err(SqlError::Parse(format!("column {c} specified more than once")));
        }
    }
    Ok(columns)
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    TooLong(usize),
    Unsupported(String),
    UnsupportedFilter(String),
    UnknownTable(String),
    UnknownColumn { table: &'static str, column: String },
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    MissingParameter(usize),
    BadValue { column: &'static str, reason: String },
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::TooLong(len) => write!(f, "query too long: {len} bytes"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnsupportedFilter(s) => write!(f, "unsupported filter: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn { table, column } => write!(f, "unknown column {column} in {table}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing value for column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingParameter(n) => write!(f, "no value bound for parameter ${n}"),
            SqlError::BadValue { column, reason } => write!(f, "invalid value for {column}: {reason}"),
        }
    }
}

impl std::error::Error for SqlError {}
