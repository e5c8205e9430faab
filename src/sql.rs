use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// How long a booking or slot query runs: explicit minutes, or the sum of
/// catalog services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Length {
    Minutes(Minutes),
    Services(Vec<Ulid>),
}

/// Parsed statement.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertPractitioner {
        id: Ulid,
        name: Option<String>,
    },
    DeletePractitioner {
        id: Ulid,
    },
    UpsertWorkingHours {
        practitioner_id: Ulid,
        window: WorkingWindow,
    },
    DeleteWorkingHours {
        practitioner_id: Ulid,
        day_of_week: u8,
    },
    BlockDate {
        practitioner_id: Ulid,
        day: NaiveDate,
        reason: Option<String>,
    },
    BlockRange {
        practitioner_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        reason: Option<String>,
    },
    UnblockDate {
        practitioner_id: Ulid,
        day: NaiveDate,
    },
    InsertService {
        id: Ulid,
        name: String,
        duration: Minutes,
    },
    DeleteService {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        practitioner_id: Ulid,
        start: NaiveDateTime,
        length: Length,
        label: Option<String>,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectSlots {
        practitioner_id: Ulid,
        day: NaiveDate,
        length: Length,
    },
    SelectBookableDays {
        practitioner_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        length: Length,
    },
    SelectPractitioners,
    SelectServices,
    SelectBookings {
        practitioner_id: Ulid,
        day: Option<NaiveDate>,
    },
    SelectBlockedDates {
        practitioner_id: Ulid,
    },
    SelectWorkingHours {
        practitioner_id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// Strip a leading keyword, case-insensitively, returning the rest.
fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    (head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace)).then_some(rest)
}

fn channel_name(rest: &str) -> String {
    rest.trim().trim_end_matches(';').trim().to_string()
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(SqlError::Empty);
    }
    if let Some(rest) = strip_keyword(trimmed, "LISTEN") {
        return Ok(Command::Listen { channel: channel_name(rest) });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN") {
        let channel = channel_name(rest);
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, trimmed).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [one] => one,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn expect_arity(table: &'static str, values: &[Expr], expected: usize) -> Result<(), SqlError> {
    if values.len() < expected {
        return Err(SqlError::WrongArity(table, expected, values.len()));
    }
    Ok(())
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let v = values.as_slice();

    match table.as_str() {
        "practitioners" => {
            expect_arity("practitioners", v, 1)?;
            Ok(Command::InsertPractitioner {
                id: parse_ulid(&v[0])?,
                name: v.get(1).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "working_hours" => {
            expect_arity("working_hours", v, 5)?;
            let window = WorkingWindow {
                day_of_week: parse_u8(&v[1])?,
                start: parse_time(&v[2])?,
                end: parse_time(&v[3])?,
                slot_interval_minutes: parse_u32(&v[4])?,
                is_active: v.get(5).map(parse_bool).transpose()?.unwrap_or(true),
            };
            Ok(Command::UpsertWorkingHours {
                practitioner_id: parse_ulid(&v[0])?,
                window,
            })
        }
        "blocked_dates" => {
            expect_arity("blocked_dates", v, 2)?;
            Ok(Command::BlockDate {
                practitioner_id: parse_ulid(&v[0])?,
                day: parse_date(&v[1])?,
                reason: v.get(2).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "blocked_ranges" => {
            expect_arity("blocked_ranges", v, 3)?;
            Ok(Command::BlockRange {
                practitioner_id: parse_ulid(&v[0])?,
                from: parse_date(&v[1])?,
                to: parse_date(&v[2])?,
                reason: v.get(3).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "services" => {
            expect_arity("services", v, 3)?;
            Ok(Command::InsertService {
                id: parse_ulid(&v[0])?,
                name: parse_string(&v[1])?,
                duration: parse_i64(&v[2])?,
            })
        }
        "bookings" => {
            expect_arity("bookings", v, 4)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&v[0])?,
                practitioner_id: parse_ulid(&v[1])?,
                start: parse_timestamp(&v[2])?,
                length: parse_length(&v[3])?,
                label: v.get(4).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::collect(delete.selection.as_ref())?;

    match table.as_str() {
        "practitioners" => Ok(Command::DeletePractitioner {
            id: parse_ulid(filters.require("id", BinaryOperator::Eq)?)?,
        }),
        "services" => Ok(Command::DeleteService {
            id: parse_ulid(filters.require("id", BinaryOperator::Eq)?)?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id: parse_ulid(filters.require("id", BinaryOperator::Eq)?)?,
        }),
        "working_hours" => Ok(Command::DeleteWorkingHours {
            practitioner_id: filters.practitioner_id()?,
            day_of_week: parse_u8(filters.require("day_of_week", BinaryOperator::Eq)?)?,
        }),
        "blocked_dates" => Ok(Command::UnblockDate {
            practitioner_id: filters.practitioner_id()?,
            day: parse_date(filters.require("day", BinaryOperator::Eq)?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let first = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&first.relation)?;
    let filters = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            practitioner_id: filters.practitioner_id()?,
            day: parse_date(filters.require("day", BinaryOperator::Eq)?)?,
            length: filters.length()?,
        }),
        "bookable_days" => Ok(Command::SelectBookableDays {
            practitioner_id: filters.practitioner_id()?,
            from: parse_date(filters.require("day", BinaryOperator::GtEq)?)?,
            to: parse_date(filters.require("day", BinaryOperator::LtEq)?)?,
            length: filters.length()?,
        }),
        "practitioners" => Ok(Command::SelectPractitioners),
        "services" => Ok(Command::SelectServices),
        "bookings" => Ok(Command::SelectBookings {
            practitioner_id: filters.practitioner_id()?,
            day: filters
                .get("day", BinaryOperator::Eq)
                .map(parse_date)
                .transpose()?,
        }),
        "blocked_dates" => Ok(Command::SelectBlockedDates {
            practitioner_id: filters.practitioner_id()?,
        }),
        "working_hours" => Ok(Command::SelectWorkingHours {
            practitioner_id: filters.practitioner_id()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column op value` comparisons from a WHERE clause joined by AND.
struct Filters<'a> {
    preds: Vec<(String, BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters { preds: Vec::new() };
        if let Some(expr) = selection {
            filters.walk(expr)?;
        }
        Ok(filters)
    }

    fn walk(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.walk(inner),
            Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
                self.walk(left)?;
                self.walk(right)
            }
            Expr::BinaryOp { left, op, right } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                self.preds.push((col, op.clone(), right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn get(&self, column: &str, op: BinaryOperator) -> Option<&'a Expr> {
        self.preds
            .iter()
            .find(|(c, o, _)| c == column && *o == op)
            .map(|(_, _, e)| *e)
    }

    fn require(&self, column: &'static str, op: BinaryOperator) -> Result<&'a Expr, SqlError> {
        self.get(column, op).ok_or(SqlError::MissingFilter(column))
    }

    fn practitioner_id(&self) -> Result<Ulid, SqlError> {
        parse_ulid(self.require("practitioner_id", BinaryOperator::Eq)?)
    }

    /// `duration = N` or `services = 'id,id'`.
    fn length(&self) -> Result<Length, SqlError> {
        if let Some(e) = self.get("duration", BinaryOperator::Eq) {
            return Ok(Length::Minutes(parse_i64(e)?));
        }
        if let Some(e) = self.get("services", BinaryOperator::Eq) {
            return Ok(Length::Services(parse_ulid_list(&parse_string(e)?)?));
        }
        Err(SqlError::MissingFilter("duration"))
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
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

fn extract_value(expr: &Expr) -> Result<&Value, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Ok(value),
        _ => Err(SqlError::Parse(format!("expected literal, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr)? {
        Value::SingleQuotedString(s) => Ok(s.clone()),
        other => Err(SqlError::Parse(format!("expected string, got {other}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr)? {
        Value::Null => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr)? {
        Value::SingleQuotedString(s) | Value::Number(s, _) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
        }
        other => Err(SqlError::Parse(format!("expected ULID, got {other}"))),
    }
}

fn parse_ulid_list(s: &str) -> Result<Vec<Ulid>, SqlError> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| Ulid::from_string(part).map_err(|e| SqlError::Parse(format!("bad ULID {part}: {e}"))))
        .collect()
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr)? {
        Value::Number(s, _) | Value::SingleQuotedString(s) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        other => Err(SqlError::Parse(format!("expected number, got {other}"))),
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr)? {
        Value::Boolean(b) => Ok(*b),
        Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Value::Number(n, _) => Ok(n != "0"),
        other => Err(SqlError::Parse(format!("expected bool, got {other}"))),
    }
}

/// A bare number is minutes; a string is either minutes or a service id list.
fn parse_length(expr: &Expr) -> Result<Length, SqlError> {
    match extract_value(expr)? {
        Value::SingleQuotedString(s) => match s.trim().parse::<Minutes>() {
            Ok(m) => Ok(Length::Minutes(m)),
            Err(_) => Ok(Length::Services(parse_ulid_list(s)?)),
        },
        _ => parse_i64(expr).map(Length::Minutes),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

fn parse_timestamp(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    let s = parse_string(expr)?;
    let s = s.trim();
    ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
