use std::collections::HashMap;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, UnaryOperator,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::{MAX_CALENDAR_YEAR, MIN_CALENDAR_YEAR};
use crate::model::*;

/// How a slot search states the appointment length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLength {
    Minutes(i64),
    Service(Ulid),
}

/// A `slots` / `suggestions` query before the service catalog and
/// engine defaults have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSearch {
    pub selector: ResourceSelector,
    pub dates: DateRange,
    pub length: SlotLength,
    pub step_minutes: Option<i64>,
    pub buffer_before_minutes: i64,
    pub buffer_after_minutes: i64,
    pub max_results: Option<usize>,
}

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    InsertStaff {
        id: Ulid,
        name: Option<String>,
        /// Monday to Friday hours; `None` creates the staff member closed all week.
        weekday_hours: Option<DayHours>,
    },
    DeleteStaff {
        id: Ulid,
    },
    InsertWorkingHours {
        resource_id: Ulid,
        weekday: Weekday,
        hours: Option<DayHours>,
    },
    InsertService {
        id: Ulid,
        name: Option<String>,
        duration_minutes: i64,
    },
    InsertAppointment(AppointmentRequest),
    DeleteAppointment {
        id: Ulid,
    },
    InsertReschedule {
        appointment_id: Ulid,
        change: Reschedule,
    },
    InsertStatusChange {
        appointment_id: Ulid,
        status: AppointmentStatus,
    },
    SelectStaff,
    SelectServices,
    SelectUnassigned,
    SelectTimeline {
        resource_id: Ulid,
        dates: DateRange,
    },
    SelectAvailability {
        resource_id: Ulid,
        dates: DateRange,
    },
    SelectSlots(SlotSearch),
    SelectSuggestions(SlotSearch),
    SelectUtilization {
        resource_id: Ulid,
        day: NaiveDate,
    },
    SelectDailyCounts {
        day: NaiveDate,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const STAFF_COLUMNS: &[&str] = &["id", "name", "opens_at", "closes_at"];
const HOURS_COLUMNS: &[&str] = &["resource_id", "weekday", "opens_at", "closes_at"];
const SERVICE_COLUMNS: &[&str] = &["id", "name", "duration_minutes"];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "start",
    "duration_minutes",
    "service_ref",
    "client_ref",
    "pet_ref",
];
const RESCHEDULE_COLUMNS: &[&str] = &["appointment_id", "resource_id", "start", "duration_minutes"];
const STATUS_COLUMNS: &[&str] = &["appointment_id", "status"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "staff" => {
            let row = Row::from_insert(insert, "staff", STAFF_COLUMNS)?;
            Ok(Command::InsertStaff {
                id: row.ulid("id")?,
                name: row.text("name")?,
                weekday_hours: row.day_hours()?,
            })
        }
        "working_hours" => {
            let row = Row::from_insert(insert, "working_hours", HOURS_COLUMNS)?;
            Ok(Command::InsertWorkingHours {
                resource_id: row.ulid("resource_id")?,
                weekday: parse_weekday(&row.require("weekday")?, "weekday")?,
                hours: row.day_hours()?,
            })
        }
        "services" => {
            let row = Row::from_insert(insert, "services", SERVICE_COLUMNS)?;
            Ok(Command::InsertService {
                id: row.ulid("id")?,
                name: row.text("name")?,
                duration_minutes: parse_int(&row.require("duration_minutes")?, "duration_minutes")?,
            })
        }
        "appointments" => {
            let row = Row::from_insert(insert, "appointments", APPOINTMENT_COLUMNS)?;
            let resource_id = row
                .text("resource_id")?
                .map(|s| parse_ulid(&s, "resource_id"))
                .transpose()?;
            let mut request = AppointmentRequest::new(
                row.ulid("id")?,
                resource_id,
                parse_datetime(&row.require("start")?, "start")?,
                parse_int(&row.require("duration_minutes")?, "duration_minutes")?,
            );
            request.service_ref = row.text("service_ref")?;
            request.client_ref = row.text("client_ref")?;
            request.pet_ref = row.text("pet_ref")?;
            Ok(Command::InsertAppointment(request))
        }
        "reschedules" => {
            let row = Row::from_insert(insert, "reschedules", RESCHEDULE_COLUMNS)?;
            let change = Reschedule {
                resource_id: row
                    .text("resource_id")?
                    .map(|s| parse_ulid(&s, "resource_id"))
                    .transpose()?,
                start: row
                    .text("start")?
                    .map(|s| parse_datetime(&s, "start"))
                    .transpose()?,
                duration_minutes: row
                    .text("duration_minutes")?
                    .map(|s| parse_int(&s, "duration_minutes"))
                    .transpose()?,
            };
            Ok(Command::InsertReschedule { appointment_id: row.ulid("appointment_id")?, change })
        }
        "status_changes" => {
            let row = Row::from_insert(insert, "status_changes", STATUS_COLUMNS)?;
            let raw = row.require("status")?;
            let status = AppointmentStatus::parse(&raw).ok_or_else(|| SqlError::InvalidValue {
                column: "status",
                reason: format!("unknown status {raw:?}"),
            })?;
            Ok(Command::InsertStatusChange { appointment_id: row.ulid("appointment_id")?, status })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row keyed by column name. Without an explicit column list the
/// table's declared column order applies.
struct Row<'a> {
    table: &'static str,
    cells: HashMap<&'static str, &'a Expr>,
}

impl<'a> Row<'a> {
    fn from_insert(
        insert: &'a ast::Insert,
        table: &'static str,
        known: &[&'static str],
    ) -> Result<Self, SqlError> {
        let values = single_values_row(insert)?;
        let columns: Vec<&'static str> = if insert.columns.is_empty() {
            if values.len() > known.len() {
                return Err(SqlError::WrongArity(table, known.len(), values.len()));
            }
            known[..values.len()].to_vec()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            insert
                .columns
                .iter()
                .map(|ident| {
                    let name = ident.value.to_lowercase();
                    known
                        .iter()
                        .find(|k| **k == name)
                        .copied()
                        .ok_or(SqlError::UnknownColumn { table, column: name })
                })
                .collect::<Result<_, _>>()?
        };
        Ok(Self {
            table,
            cells: columns.into_iter().zip(values.iter()).collect(),
        })
    }

    /// Value of `column`; `None` when the column is absent or NULL.
    fn text(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        match self.cells.get(column) {
            Some(expr) => scalar(expr),
            None => Ok(None),
        }
    }

    fn require(&self, column: &'static str) -> Result<String, SqlError> {
        self.text(column)?.ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(&self.require(column)?, column)
    }

    /// `opens_at` / `closes_at`, both set or both NULL.
    fn day_hours(&self) -> Result<Option<DayHours>, SqlError> {
        let open = self.text("opens_at")?.map(|s| parse_time(&s, "opens_at")).transpose()?;
        let close = self.text("closes_at")?.map(|s| parse_time(&s, "closes_at")).transpose()?;
        match (open, close) {
            (None, None) => Ok(None),
            (Some(open), Some(close)) => DayHours::new(open, close).map(Some).ok_or(SqlError::InvalidValue {
                column: "closes_at",
                reason: "must be after opens_at".into(),
            }),
            _ => Err(SqlError::InvalidValue {
                column: "opens_at",
                reason: "opens_at and closes_at must both be set or both NULL".into(),
            }),
        }
    }
}

fn single_values_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;
    let id = filters.ulid("id")?;

    match table.as_str() {
        "staff" => Ok(Command::DeleteStaff { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "staff" => Ok(Command::SelectStaff),
        "services" => Ok(Command::SelectServices),
        "unassigned" => Ok(Command::SelectUnassigned),
        "timeline" => Ok(Command::SelectTimeline {
            resource_id: filters.ulid("resource_id")?,
            dates: filters.date_range()?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            resource_id: filters.ulid("resource_id")?,
            dates: filters.date_range()?,
        }),
        "slots" => Ok(Command::SelectSlots(filters.slot_search()?)),
        "suggestions" => Ok(Command::SelectSuggestions(filters.slot_search()?)),
        "utilization" => Ok(Command::SelectUtilization {
            resource_id: filters.ulid("resource_id")?,
            day: filters.day()?,
        }),
        "daily_counts" => Ok(Command::SelectDailyCounts { day: filters.day()? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunctive WHERE clause flattened by column.
#[derive(Default)]
struct Filters<'a> {
    eq: HashMap<String, &'a Expr>,
    lower: HashMap<String, &'a Expr>,
    upper: HashMap<String, &'a Expr>,
    lists: HashMap<String, &'a [Expr]>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                if *op == ast::BinaryOperator::And {
                    self.collect(left)?;
                    return self.collect(right);
                }
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                let slot = match op {
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.lower,
                    ast::BinaryOperator::LtEq => &mut self.upper,
                    _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
                };
                slot.insert(column, right.as_ref());
                Ok(())
            }
            Expr::InList { expr: column, list, negated: false } => {
                let column = expr_column_name(column)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                self.lists.insert(column, list.as_slice());
                Ok(())
            }
            Expr::Between { expr: column, negated: false, low, high } => {
                let column = expr_column_name(column)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                self.lower.insert(column.clone(), low.as_ref());
                self.upper.insert(column, high.as_ref());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn eq_value(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        match self.eq.get(column) {
            Some(expr) => scalar(expr),
            None => Ok(None),
        }
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        let raw = self.eq_value(column)?.ok_or(SqlError::MissingFilter(column))?;
        parse_ulid(&raw, column)
    }

    fn int(&self, column: &'static str) -> Result<Option<i64>, SqlError> {
        self.eq_value(column)?.map(|s| parse_int(&s, column)).transpose()
    }

    fn day(&self) -> Result<NaiveDate, SqlError> {
        let raw = self.eq_value("day")?.ok_or(SqlError::MissingFilter("day"))?;
        parse_date(&raw, "day")
    }

    /// `day = d`, or `day >= a AND day <= b` (or `BETWEEN`).
    fn date_range(&self) -> Result<DateRange, SqlError> {
        if self.eq.contains_key("day") {
            return Ok(DateRange::day(self.day()?));
        }
        let bound = |map: &HashMap<String, &Expr>| -> Result<NaiveDate, SqlError> {
            let expr = map.get("day").ok_or(SqlError::MissingFilter("day"))?;
            let raw = scalar(expr)?.ok_or(SqlError::MissingFilter("day"))?;
            parse_date(&raw, "day")
        };
        let (first, last) = (bound(&self.lower)?, bound(&self.upper)?);
        if first > last {
            return Err(SqlError::InvalidValue {
                column: "day",
                reason: "range ends before it starts".into(),
            });
        }
        Ok(DateRange::new(first, last))
    }

    /// `resource_id = 'any'` (or no filter) searches all active staff.
    fn selector(&self) -> Result<ResourceSelector, SqlError> {
        if let Some(list) = self.lists.get("resource_id") {
            let ids = list
                .iter()
                .map(|expr| {
                    let raw = scalar(expr)?.ok_or(SqlError::InvalidValue {
                        column: "resource_id",
                        reason: "NULL in list".into(),
                    })?;
                    parse_ulid(&raw, "resource_id")
                })
                .collect::<Result<_, _>>()?;
            return Ok(ResourceSelector::AnyOf(ids));
        }
        match self.eq_value("resource_id")? {
            None => Ok(ResourceSelector::AnyAvailable),
            Some(raw) if raw.eq_ignore_ascii_case("any") => Ok(ResourceSelector::AnyAvailable),
            Some(raw) => Ok(ResourceSelector::Specific(parse_ulid(&raw, "resource_id")?)),
        }
    }

    fn slot_search(&self) -> Result<SlotSearch, SqlError> {
        let length = match (self.int("duration_minutes")?, self.eq_value("service_id")?) {
            (Some(minutes), _) => SlotLength::Minutes(minutes),
            (None, Some(raw)) => SlotLength::Service(parse_ulid(&raw, "service_id")?),
            (None, None) => return Err(SqlError::MissingFilter("duration_minutes")),
        };
        let max_results = self
            .int("max_results")?
            .map(|n| {
                usize::try_from(n).map_err(|_| SqlError::InvalidValue {
                    column: "max_results",
                    reason: format!("{n} is negative"),
                })
            })
            .transpose()?;
        Ok(SlotSearch {
            selector: self.selector()?,
            dates: self.date_range()?,
            length,
            step_minutes: self.int("step")?,
            buffer_before_minutes: self.int("buffer_before")?.unwrap_or(0),
            buffer_after_minutes: self.int("buffer_after")?.unwrap_or(0),
            max_results,
        })
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

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Literal as text; `None` for NULL.
fn scalar(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp { op: UnaryOperator::Minus, expr } => {
            Ok(scalar(expr)?.map(|s| format!("-{s}")))
        }
        Expr::Nested(inner) => scalar(inner),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
    }
}

fn invalid(column: &'static str, reason: impl std::fmt::Display) -> SqlError {
    SqlError::InvalidValue { column, reason: reason.to_string() }
}

fn parse_ulid(raw: &str, column: &'static str) -> Result<Ulid, SqlError> {
    Ulid::from_string(raw.trim()).map_err(|e| invalid(column, format!("bad ULID: {e}")))
}

fn parse_int(raw: &str, column: &'static str) -> Result<i64, SqlError> {
    raw.trim().parse().map_err(|e| invalid(column, format!("bad integer: {e}")))
}

fn in_calendar(day: NaiveDate, column: &'static str) -> Result<(), SqlError> {
    if (MIN_CALENDAR_YEAR..=MAX_CALENDAR_YEAR).contains(&day.year()) {
        Ok(())
    } else {
        Err(invalid(
            column,
            format!("year must be {MIN_CALENDAR_YEAR}-{MAX_CALENDAR_YEAR}"),
        ))
    }
}

fn parse_date(raw: &str, column: &'static str) -> Result<NaiveDate, SqlError> {
    let day = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| invalid(column, format!("bad date: {e}")))?;
    in_calendar(day, column)?;
    Ok(day)
}

fn parse_datetime(raw: &str, column: &'static str) -> Result<NaiveDateTime, SqlError> {
    const FORMATS: [&str; 4] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];
    let raw = raw.trim();
    let at = FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| invalid(column, format!("bad timestamp {raw:?}")))?;
    in_calendar(at.date(), column)?;
    Ok(at)
}

fn parse_time(raw: &str, column: &'static str) -> Result<NaiveTime, SqlError> {
    let raw = raw.trim();
    ["%H:%M:%S", "%H:%M"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| invalid(column, format!("bad time {raw:?}")))
}

/// ISO number (1 = Monday) or English name.
fn parse_weekday(raw: &str, column: &'static str) -> Result<Weekday, SqlError> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<u8>() {
        return match n {
            1..=7 => Weekday::try_from(n - 1).map_err(|e| invalid(column, e)),
            _ => Err(invalid(column, format!("{n} is not 1-7"))),
        };
    }
    raw.parse::<Weekday>()
        .map_err(|_| invalid(column, format!("bad weekday {raw:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{table}: unknown column {column}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid {column}: {reason}")]
    InvalidValue { column: &'static str, reason: String },
}
