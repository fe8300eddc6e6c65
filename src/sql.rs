use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::config::parse_hhmm;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// Unset options fall back to server defaults.
    InsertFacility {
        id: Ulid,
        name: Option<String>,
        slot_minutes: Option<u32>,
        auto_confirm: Option<bool>,
    },
    InsertHours {
        facility_id: Ulid,
        weekday: u8,
        hours: Option<DayHours>,
    },
    InsertService {
        service: Service,
    },
    InsertBooking {
        facility_id: Ulid,
        request: BookingRequest,
    },
    SetBookingStatus {
        booking_id: Ulid,
        status: BookingStatus,
    },
    CancelBooking {
        id: Ulid,
    },
    SelectSlots {
        facility_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        staff_id: Option<Ulid>,
    },
    SelectBookings {
        facility_id: Ulid,
        date: Option<NaiveDate>,
        staff_id: Option<Ulid>,
    },
    SelectFacilities,
    SelectServices {
        facility_id: Ulid,
    },
}

// Positional order when an INSERT has no column list.
const FACILITY_COLUMNS: &[&str] = &["id", "name", "slot_minutes", "auto_confirm"];
const HOURS_COLUMNS: &[&str] = &["facility_id", "weekday", "open", "close"];
const SERVICE_COLUMNS: &[&str] = &["id", "facility_id", "name", "duration", "price", "active", "category"];
const BOOKING_COLUMNS: &[&str] = &[
    "facility_id",
    "customer_name",
    "customer_email",
    "service_id",
    "start",
    "staff_id",
    "notes",
    "idempotency_key",
];
const STATUS_COLUMNS: &[&str] = &["booking_id", "status"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// One VALUES row, addressable by column name.
struct Row<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        known: &'static [&'static str],
        columns: &[ast::Ident],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            if values.len() > known.len() {
                return Err(SqlError::WrongArity(table, known.len(), values.len()));
            }
            known.iter().take(values.len()).map(|c| c.to_string()).collect()
        } else {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            let names: Vec<String> = columns.iter().map(|c| c.value.to_lowercase()).collect();
            if let Some(unknown) = names.iter().find(|n| !known.contains(&n.as_str())) {
                return Err(SqlError::UnknownColumn(table, unknown.clone()));
            }
            names
        };
        Ok(Self {
            table,
            values: names.into_iter().zip(values).collect(),
        })
    }

    /// Absent and NULL are the same.
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied().filter(|e| !is_null(e))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns = &insert.columns;

    match table.as_str() {
        "facilities" => {
            let row = Row::new("facilities", FACILITY_COLUMNS, columns, &values)?;
            Ok(Command::InsertFacility {
                id: parse_ulid(row.require("id")?)?,
                name: row.get("name").map(parse_text).transpose()?,
                slot_minutes: row.get("slot_minutes").map(parse_u32).transpose()?,
                auto_confirm: row.get("auto_confirm").map(parse_bool).transpose()?,
            })
        }
        "hours" => {
            let row = Row::new("hours", HOURS_COLUMNS, columns, &values)?;
            let open = row.get("open").map(parse_time_of_day).transpose()?;
            let close = row.get("close").map(parse_time_of_day).transpose()?;
            let hours = match (open, close) {
                (Some(open), Some(close)) => Some(DayHours::new(open, close)),
                (None, None) => None,
                _ => return Err(SqlError::Parse("open and close must both be set or both NULL".into())),
            };
            Ok(Command::InsertHours {
                facility_id: parse_ulid(row.require("facility_id")?)?,
                weekday: parse_weekday(row.require("weekday")?)?,
                hours,
            })
        }
        "services" => {
            let row = Row::new("services", SERVICE_COLUMNS, columns, &values)?;
            Ok(Command::InsertService {
                service: Service {
                    id: parse_ulid(row.require("id")?)?,
                    facility_id: parse_ulid(row.require("facility_id")?)?,
                    name: parse_text(row.require("name")?)?,
                    duration_min: parse_u32(row.require("duration")?)?,
                    price: row.get("price").map(parse_i64).transpose()?.unwrap_or(0),
                    active: row.get("active").map(parse_bool).transpose()?.unwrap_or(true),
                    category: row.get("category").map(parse_text).transpose()?,
                },
            })
        }
        "bookings" => {
            let row = Row::new("bookings", BOOKING_COLUMNS, columns, &values)?;
            Ok(Command::InsertBooking {
                facility_id: parse_ulid(row.require("facility_id")?)?,
                request: BookingRequest {
                    customer_name: parse_text(row.require("customer_name")?)?,
                    customer_email: parse_text(row.require("customer_email")?)?,
                    service_id: parse_ulid(row.require("service_id")?)?,
                    start: parse_datetime(row.require("start")?)?,
                    staff_id: row.get("staff_id").map(parse_ulid).transpose()?,
                    notes: row.get("notes").map(parse_text).transpose()?,
                    idempotency_key: row.get("idempotency_key").map(parse_text).transpose()?,
                },
            })
        }
        "booking_status" => {
            let row = Row::new("booking_status", STATUS_COLUMNS, columns, &values)?;
            let raw = parse_text(row.require("status")?)?;
            Ok(Command::SetBookingStatus {
                booking_id: parse_ulid(row.require("booking_id")?)?,
                status: raw.parse().map_err(|e: UnknownStatus| SqlError::Parse(e.to_string()))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking {
            id: extract_where_id(&delete.selection)?,
        }),
        _ => Err(SqlError::Unsupported(format!("DELETE FROM {table}"))),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_equalities(selection, &mut filters)?;
    }
    let ulid_filter = |col: &'static str| -> Result<Option<Ulid>, SqlError> {
        filters.get(col).copied().filter(|e| !is_null(e)).map(parse_ulid).transpose()
    };
    let date_filter = || -> Result<Option<NaiveDate>, SqlError> {
        filters.get("date").copied().map(parse_date).transpose()
    };

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            facility_id: ulid_filter("facility_id")?.ok_or(SqlError::MissingFilter("facility_id"))?,
            service_id: ulid_filter("service_id")?.ok_or(SqlError::MissingFilter("service_id"))?,
            date: date_filter()?.ok_or(SqlError::MissingFilter("date"))?,
            staff_id: ulid_filter("staff_id")?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            facility_id: ulid_filter("facility_id")?.ok_or(SqlError::MissingFilter("facility_id"))?,
            date: date_filter()?,
            staff_id: ulid_filter("staff_id")?,
        }),
        "facilities" => Ok(Command::SelectFacilities),
        "services" => Ok(Command::SelectServices {
            facility_id: ulid_filter("facility_id")?.ok_or(SqlError::MissingFilter("facility_id"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y ...` into column → value.
fn collect_equalities<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.insert(col, right.as_ref());
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

/// Single-row VALUES only; one admission per statement.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            rows => Err(SqlError::Unsupported(format!("{}-row INSERT", rows.len()))),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. })) => {
            Ok(s.clone())
        }
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(other) => Err(SqlError::Parse(format!("expected ULID string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(true),
            "false" | "f" | "0" | "no" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// `mon`..`sun` (or full names), or 0..6 with Monday = 0.
fn parse_weekday(expr: &Expr) -> Result<u8, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        let lower = s.trim().to_lowercase();
        if let Ok(n) = lower.parse::<u8>() {
            return weekday_index(n);
        }
        let day: chrono::Weekday = lower
            .parse()
            .map_err(|_| SqlError::Parse(format!("bad weekday: {s}")))?;
        return Ok(day.num_days_from_monday() as u8);
    }
    let n = parse_i64(expr)?;
    u8::try_from(n)
        .map_err(|_| SqlError::Parse(format!("weekday {n} not in 0..=6")))
        .and_then(weekday_index)
}

fn weekday_index(n: u8) -> Result<u8, SqlError> {
    if n <= 6 {
        Ok(n)
    } else {
        Err(SqlError::Parse(format!("weekday {n} not in 0..=6")))
    }
}

fn parse_time_of_day(expr: &Expr) -> Result<u32, SqlError> {
    let s = parse_text(expr)?;
    parse_hhmm(&s).ok_or_else(|| SqlError::Parse(format!("bad time of day {s:?}, expected HH:MM")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"];

fn parse_datetime(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    let s = parse_text(expr)?;
    let trimmed = s.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| SqlError::Parse(format!("bad start {s:?}, expected YYYY-MM-DD HH:MM")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
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
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: {c} is required"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
