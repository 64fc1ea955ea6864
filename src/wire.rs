use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Weekday};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SalonAuthSource;
use crate::engine::{Engine, EngineError};
use crate::limits::MAX_SLOTS_PER_QUERY;
use crate::model::*;
use crate::observability::{command_label, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SlotLength, SlotSearch};
use crate::tenant::TenantManager;

const DEFAULT_SUGGESTIONS: usize = 10;

pub struct SalonHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SalonQueryParser>,
}

impl SalonHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SalonQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            user_error("08006", format!("salon error: {e}"))
        })
    }

    /// Parse, execute and record one statement.
    async fn run(
        &self,
        engine: &Engine,
        sql: &str,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(|e| {
            metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error").increment(1);
            sql_err(e)
        })?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertStaff { id, name, weekday_hours } => {
                let hours = weekday_hours.map_or_else(WorkingHours::closed, WorkingHours::weekdays);
                engine.create_resource(id, name, hours).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteStaff { id } => {
                engine.deactivate_resource(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertWorkingHours { resource_id, weekday, hours } => {
                engine
                    .set_working_hours(resource_id, weekday, hours)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertService { id, name, duration_minutes } => {
                engine
                    .register_service(id, name, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertAppointment(request) => {
                engine.book(request).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteAppointment { id } => {
                engine.cancel(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertReschedule { appointment_id, change } => {
                engine
                    .reschedule(appointment_id, change)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertStatusChange { appointment_id, status } => {
                engine
                    .update_status(appointment_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SelectStaff => {
                let staff = engine.list_resources().await;
                rows(schema_for("staff", format), staff, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.name)?;
                    enc.encode_field(&r.active)?;
                    enc.encode_field(&describe_hours(&r.hours))
                })
            }
            Command::SelectServices => {
                rows(schema_for("services", format), engine.list_services(), |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&s.duration_minutes)
                })
            }
            Command::SelectUnassigned => {
                let pool = engine.unassigned().await;
                rows(schema_for("unassigned", format), pool, encode_appointment)
            }
            Command::SelectTimeline { resource_id, dates } => {
                let appointments = engine
                    .intervals_for(resource_id, dates)
                    .await
                    .map_err(engine_err)?;
                rows(schema_for("timeline", format), appointments, encode_appointment)
            }
            Command::SelectAvailability { resource_id, dates } => {
                let windows = engine
                    .free_windows(resource_id, dates)
                    .await
                    .map_err(engine_err)?;
                let rid = resource_id.to_string();
                rows(schema_for("availability", format), windows, |enc, w| {
                    enc.encode_field(&rid)?;
                    enc.encode_field(&timestamp(w.start))?;
                    enc.encode_field(&timestamp(w.end))
                })
            }
            Command::SelectSlots(search) => {
                let (query, max) = slot_query(engine, search).map_err(engine_err)?;
                let slots = engine
                    .find_slots(&query, max.unwrap_or(MAX_SLOTS_PER_QUERY))
                    .await
                    .map_err(engine_err)?;
                rows(schema_for("slots", format), slots, encode_slot)
            }
            Command::SelectSuggestions(search) => {
                let (query, max) = slot_query(engine, search).map_err(engine_err)?;
                let slots = engine
                    .suggest_slots(&query, max.unwrap_or(DEFAULT_SUGGESTIONS))
                    .await
                    .map_err(engine_err)?;
                rows(schema_for("suggestions", format), slots, encode_slot)
            }
            Command::SelectUtilization { resource_id, day } => {
                let report = engine
                    .utilization(resource_id, day)
                    .await
                    .map_err(engine_err)?;
                rows(schema_for("utilization", format), [report], |enc, r| {
                    enc.encode_field(&r.resource_id.to_string())?;
                    enc.encode_field(&r.day.to_string())?;
                    enc.encode_field(&r.booked_minutes)?;
                    enc.encode_field(&r.working_minutes)?;
                    enc.encode_field(&r.ratio)?;
                    enc.encode_field(&(r.appointment_count as i64))
                })
            }
            Command::SelectDailyCounts { day } => {
                let counts = engine.daily_counts(day).await;
                rows(schema_for("daily_counts", format), [counts], |enc, c| {
                    enc.encode_field(&day.to_string())?;
                    enc.encode_field(&(c.total as i64))?;
                    for status in AppointmentStatus::ALL {
                        enc.encode_field(&(c.count(status) as i64))?;
                    }
                    Ok(())
                })
            }
        }
    }
}

/// Apply the service catalog and engine defaults to a parsed slot search.
fn slot_query(engine: &Engine, search: SlotSearch) -> Result<(SlotQuery, Option<usize>), EngineError> {
    let minutes = match search.length {
        SlotLength::Minutes(m) => m,
        SlotLength::Service(id) => engine.service(id)?.duration_minutes,
    };
    let step = search.step_minutes.unwrap_or(engine.config.grid_step_minutes);
    let query = SlotQuery::new(search.selector, search.dates, minutes, step)
        .with_buffers(search.buffer_before_minutes, search.buffer_after_minutes);
    Ok((query, search.max_results))
}

fn inserted(n: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(n))
}

fn deleted(n: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(n))
}

fn timestamp(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// `mon 09:00-18:00, tue 09:00-18:00, ...`; empty when closed all week.
fn describe_hours(hours: &WorkingHours) -> String {
    const WEEK: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];
    WEEK.iter()
        .filter_map(|day| {
            hours.for_weekday(*day).map(|h| {
                format!(
                    "{} {}-{}",
                    day.to_string().to_lowercase(),
                    h.open.format("%H:%M"),
                    h.close.format("%H:%M")
                )
            })
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn encode_appointment(enc: &mut DataRowEncoder, a: Appointment) -> PgWireResult<()> {
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.resource_id.map(|r| r.to_string()))?;
    enc.encode_field(&timestamp(a.start))?;
    enc.encode_field(&timestamp(a.end()))?;
    enc.encode_field(&a.duration_minutes)?;
    enc.encode_field(&a.status.as_str().to_string())?;
    enc.encode_field(&a.service_ref)?;
    enc.encode_field(&a.client_ref)?;
    enc.encode_field(&a.pet_ref)
}

fn encode_slot(enc: &mut DataRowEncoder, s: Slot) -> PgWireResult<()> {
    enc.encode_field(&s.resource_id.to_string())?;
    enc.encode_field(&timestamp(s.start))?;
    enc.encode_field(&timestamp(s.end))?;
    enc.encode_field(&s.score)
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn columns_for(table: &str) -> Vec<(&'static str, Type)> {
    match table {
        "staff" => vec![
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("active", Type::BOOL),
            ("hours", Type::VARCHAR),
        ],
        "services" => vec![
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("duration_minutes", Type::INT8),
        ],
        "timeline" | "unassigned" => vec![
            ("id", Type::VARCHAR),
            ("resource_id", Type::VARCHAR),
            ("start", Type::VARCHAR),
            ("end", Type::VARCHAR),
            ("duration_minutes", Type::INT8),
            ("status", Type::VARCHAR),
            ("service_ref", Type::VARCHAR),
            ("client_ref", Type::VARCHAR),
            ("pet_ref", Type::VARCHAR),
        ],
        "availability" => vec![
            ("resource_id", Type::VARCHAR),
            ("start", Type::VARCHAR),
            ("end", Type::VARCHAR),
        ],
        "slots" | "suggestions" => vec![
            ("resource_id", Type::VARCHAR),
            ("start", Type::VARCHAR),
            ("end", Type::VARCHAR),
            ("score", Type::INT8),
        ],
        "utilization" => vec![
            ("resource_id", Type::VARCHAR),
            ("day", Type::VARCHAR),
            ("booked_minutes", Type::INT8),
            ("working_minutes", Type::INT8),
            ("ratio", Type::FLOAT8),
            ("appointment_count", Type::INT8),
        ],
        "daily_counts" => [("day", Type::VARCHAR), ("total", Type::INT8)]
            .into_iter()
            .chain(AppointmentStatus::ALL.map(|s| (s.as_str(), Type::INT8)))
            .collect(),
        _ => vec![],
    }
}

fn schema_for(table: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    columns_for(table)
        .into_iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(idx));
            FieldInfo::new(name.into(), None, None, ty, field_format)
        })
        .collect()
}

/// Table named after the first FROM of a SELECT, for describe messages.
fn select_table(sql: &str) -> Option<String> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return None;
    }
    let mut words = lower.split_whitespace();
    words.find(|w| *w == "from")?;
    words.next().map(|w| {
        w.trim_matches(|c: char| !(c.is_alphanumeric() || c == '_'))
            .to_string()
    })
}

fn describe_schema(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    select_table(sql).map_or_else(Vec::new, |table| schema_for(&table, format))
}

#[async_trait]
impl SimpleQueryHandler for SalonHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let response = self.run(&engine, query, None).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SalonQueryParser;

#[async_trait]
impl QueryParser for SalonQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SalonHandler {
    type Statement = String;
    type QueryParser = SalonQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql, Some(&portal.result_column_format)).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            describe_schema(&target.statement, None),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            Some(&target.result_column_format),
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i > start
            && let Ok(n) = sql[start..i].parse::<usize>()
        {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so $1 never clobbers the prefix of $10.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SalonFactory {
    handler: Arc<SalonHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SalonAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SalonFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SalonAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SalonHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SalonFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SalonFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine error kind.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::OverlapConflict { .. } => "23P01",
        EngineError::OutsideWorkingHours { .. }
        | EngineError::InvalidDuration(_)
        | EngineError::InvalidQuery(_) => "22023",
        EngineError::ResourceNotFound(_) | EngineError::NotFound(_) => "P0002",
        EngineError::PastDateRejected { .. } => "22007",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidTransition { .. } | EngineError::AppointmentClosed(_) => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::JournalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::hm;

    #[test]
    fn sqlstates_by_kind() {
        let id = ulid::Ulid::new();
        assert_eq!(sqlstate(&EngineError::OverlapConflict { with: id }), "23P01");
        assert_eq!(sqlstate(&EngineError::InvalidDuration(0)), "22023");
        assert_eq!(sqlstate(&EngineError::ResourceNotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::AppointmentClosed(id)), "55000");
        assert_eq!(sqlstate(&EngineError::JournalError("disk".into())), "58030");
    }

    #[test]
    fn params_counted_and_substituted() {
        assert_eq!(count_params("SELECT * FROM staff"), 0);
        assert_eq!(count_params("SELECT * FROM timeline WHERE resource_id = $1 AND day = $12"), 12);
    }

    #[test]
    fn select_table_detection() {
        assert_eq!(select_table("SELECT * FROM slots WHERE day = $1").as_deref(), Some("slots"));
        assert_eq!(select_table("select * from \"daily_counts\";").as_deref(), Some("daily_counts"));
        assert_eq!(select_table("INSERT INTO staff (id) VALUES ($1)"), None);
        assert_eq!(describe_schema("SELECT * FROM daily_counts", None).len(), 8);
    }

    #[test]
    fn hours_description() {
        let hours = WorkingHours::closed()
            .with_day(Weekday::Tue, DayHours::new(hm(9, 0), hm(17, 30)))
            .with_day(Weekday::Sat, DayHours::new(hm(10, 0), hm(14, 0)));
        assert_eq!(describe_hours(&hours), "tue 09:00-17:30, sat 10:00-14:00");
        assert_eq!(describe_hours(&WorkingHours::closed()), "");
    }
}
