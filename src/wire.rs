use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
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

use crate::auth::SharedPasswordAuthSource;
use crate::config::Config;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

/// Settings applied to facilities created without explicit values.
#[derive(Debug, Clone, Copy)]
pub struct FacilityDefaults {
    pub slot_minutes: u32,
    pub auto_confirm: bool,
    pub hours: DayHours,
}

impl From<&Config> for FacilityDefaults {
    fn from(cfg: &Config) -> Self {
        Self {
            slot_minutes: cfg.default_slot_minutes,
            auto_confirm: true,
            hours: cfg.default_hours,
        }
    }
}

pub struct BookingHandler {
    engine: Arc<Engine>,
    defaults: FacilityDefaults,
    query_parser: Arc<BookingQueryParser>,
}

impl BookingHandler {
    pub fn new(engine: Arc<Engine>, defaults: FacilityDefaults) -> Self {
        Self {
            engine,
            defaults,
            query_parser: Arc::new(BookingQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertFacility {
                id,
                name,
                slot_minutes,
                auto_confirm,
            } => {
                engine
                    .create_facility(
                        id,
                        name,
                        slot_minutes.unwrap_or(self.defaults.slot_minutes),
                        auto_confirm.unwrap_or(self.defaults.auto_confirm),
                        OperatingHours::uniform(self.defaults.hours),
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertHours {
                facility_id,
                weekday,
                hours,
            } => {
                engine
                    .set_operating_hours(facility_id, weekday, hours)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertService { service } => {
                engine.upsert_service(service).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertBooking { facility_id, request } => {
                let booking = engine
                    .create_booking(facility_id, request)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_rows(vec![booking])?])
            }
            Command::SetBookingStatus { booking_id, status } => {
                let booking = engine
                    .set_booking_status(booking_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_rows(vec![booking])?])
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectSlots {
                facility_id,
                service_id,
                date,
                staff_id,
            } => {
                let slots = engine
                    .available_slots(facility_id, date, service_id, staff_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.label())?;
                        encoder.encode_field(&slot.available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBookings {
                facility_id,
                date,
                staff_id,
            } => {
                let bookings = engine
                    .list_bookings(facility_id, date, staff_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_rows(bookings)?])
            }
            Command::SelectFacilities => {
                let facilities = engine.list_facilities().await;
                let schema = Arc::new(facilities_schema());
                let rows: Vec<PgWireResult<_>> = facilities
                    .into_iter()
                    .map(|f| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&f.id.to_string())?;
                        encoder.encode_field(&f.name)?;
                        encoder.encode_field(&(f.slot_minutes as i64))?;
                        encoder.encode_field(&f.auto_confirm)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectServices { facility_id } => {
                let services = engine.list_services(facility_id).await.map_err(engine_err)?;
                let schema = Arc::new(services_schema());
                let rows: Vec<PgWireResult<_>> = services
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.facility_id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&(s.duration_min as i64))?;
                        encoder.encode_field(&s.price)?;
                        encoder.encode_field(&s.active)?;
                        encoder.encode_field(&s.category)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

fn format_instant(ms: Ms) -> String {
    naive_from_ms(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn booking_rows(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.facility_id.to_string())?;
            encoder.encode_field(&b.customer_id.to_string())?;
            encoder.encode_field(&b.service_id.to_string())?;
            encoder.encode_field(&b.staff_id.map(|s| s.to_string()))?;
            encoder.encode_field(&format_instant(b.span.start))?;
            encoder.encode_field(&format_instant(b.span.end))?;
            encoder.encode_field(&b.status.to_string())?;
            encoder.encode_field(&b.notes)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text_field("time", Type::VARCHAR), text_field("available", Type::BOOL)]
}

fn bookings_schema() -> Vec<FieldInfo> {
    [
        "id",
        "facility_id",
        "customer_id",
        "service_id",
        "staff_id",
        "start",
        "end",
        "status",
        "notes",
    ]
    .into_iter()
    .map(|name| text_field(name, Type::VARCHAR))
    .collect()
}

fn facilities_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("slot_minutes", Type::INT8),
        text_field("auto_confirm", Type::BOOL),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("facility_id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("duration", Type::INT8),
        text_field("price", Type::INT8),
        text_field("active", Type::BOOL),
        text_field("category", Type::VARCHAR),
    ]
}

/// Row shape of a statement, decided from its text so placeholders need not be bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if normalized.contains("FROM SLOTS") {
        slots_schema()
    } else if (normalized.starts_with("SELECT") && normalized.contains("FROM BOOKINGS"))
        || normalized.starts_with("INSERT INTO BOOKINGS")
        || normalized.starts_with("INSERT INTO BOOKING_STATUS")
    {
        bookings_schema()
    } else if normalized.contains("FROM FACILITIES") && normalized.starts_with("SELECT") {
        facilities_schema()
    } else if normalized.contains("FROM SERVICES") && normalized.starts_with("SELECT") {
        services_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for BookingHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BookingQueryParser;

#[async_trait]
impl QueryParser for BookingQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BookingHandler {
    type Statement = String;
    type QueryParser = BookingQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| sql_err(SqlError::Empty))
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder outside string literals.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut in_string = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\'' => in_string = !in_string,
            '$' if !in_string => {
                let digits: String = sql[i + 1..].chars().take_while(|d| d.is_ascii_digit()).collect();
                if let Ok(n) = digits.parse::<usize>() {
                    max = max.max(n);
                }
            }
            _ => {}
        }
    }
    max
}

/// Inline text-format parameters as quoted literals in one left-to-right pass.
/// Placeholders inside string literals stay as written, and inlined values
/// are never scanned again.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_string = false;
    let mut chars = sql.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_string = !in_string;
        } else if c == '$' && !in_string {
            let digits = sql[i + 1..].chars().take_while(|d| d.is_ascii_digit()).count();
            let param = sql[i + 1..i + 1 + digits]
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|idx| params.get(idx));
            if let Some(param) = param {
                out.push_str(&param_literal(param));
                for _ in 0..digits {
                    chars.next();
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn param_literal(param: &Option<Bytes>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BookingServerFactory {
    handler: Arc<BookingHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl BookingServerFactory {
    pub fn new(engine: Arc<Engine>, defaults: FacilityDefaults, password: String) -> Self {
        let auth_source = SharedPasswordAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BookingHandler::new(engine, defaults)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BookingServerFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<BookingServerFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Configuration(_) => "F0000",
        EngineError::SlotTaken(_) => "23P01",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::NotFound(_) => "42704",
        EngineError::AlreadyExists(_) => "42710",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::StoreUnavailable(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let message = match &e {
        EngineError::StoreUnavailable(detail) => {
            tracing::error!("store unavailable: {detail}");
            "booking store unavailable, retry later".to_string()
        }
        other => other.to_string(),
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        message,
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn sqlstates_are_distinct() {
        let id = Ulid::new();
        let errors = [
            EngineError::Validation("x".into()),
            EngineError::Configuration("x".into()),
            EngineError::SlotTaken(id),
            EngineError::InvalidTransition {
                from: BookingStatus::Completed,
                to: BookingStatus::Cancelled,
            },
            EngineError::NotFound(id),
            EngineError::AlreadyExists(id),
            EngineError::LimitExceeded("x"),
            EngineError::StoreUnavailable("disk".into()),
        ];
        let mut codes: Vec<_> = errors.iter().map(sqlstate).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert_eq!(sqlstate(&EngineError::SlotTaken(id)), "23P01");
    }

    #[test]
    fn params_counted_outside_literals() {
        assert_eq!(count_params("SELECT * FROM slots WHERE facility_id = $1 AND date = $2"), 2);
        assert_eq!(count_params("INSERT INTO bookings (notes) VALUES ('costs $5')"), 0);
        assert_eq!(count_params("SELECT $10, $2"), 10);
    }

    #[test]
    fn substitution_quotes_and_nulls() {
        let params = vec![Some(Bytes::from_static(b"O'Brien")), None];
        let sql = substitute_params("VALUES ($1, $2)", &params);
        assert_eq!(sql, "VALUES ('O''Brien', NULL)");
    }

    #[test]
    fn substitution_never_rescans_values_or_touches_literals() {
        let params = vec![
            Some(Bytes::from_static(b"01ARZ3NDEKTSV4RRFFQ69G5FAV")),
            Some(Bytes::from_static(b"bring $1 cash")),
        ];
        let sql = substitute_params("VALUES ($1, $2)", &params);
        assert_eq!(sql, "VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'bring $1 cash')");

        let sql = substitute_params("VALUES ($1, 'costs $2', 'it''s $1')", &params);
        assert_eq!(sql, "VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'costs $2', 'it''s $1')");
    }

    #[test]
    fn substitution_matches_whole_placeholder_numbers() {
        let params: Vec<_> = (1..=10).map(|n| Some(Bytes::from(n.to_string()))).collect();
        assert_eq!(substitute_params("SELECT $10, $1", &params), "SELECT '10', '1'");
        // Out of range placeholders are left for the parser to reject.
        assert_eq!(substitute_params("SELECT $11", &params), "SELECT $11");
    }

    #[test]
    fn store_fault_reported_generically() {
        let err = engine_err(EngineError::StoreUnavailable("fsync failed: disk full".into()));
        match err {
            PgWireError::UserError(info) => {
                assert_eq!(info.code, "58000");
                assert_eq!(info.severity, "ERROR");
                assert!(!info.message.contains("disk full"));
                assert_eq!(info.message, "booking store unavailable, retry later");
            }
            other => panic!("expected a user error, got {other:?}"),
        }

        match engine_err(EngineError::SlotTaken(Ulid::new())) {
            PgWireError::UserError(info) => assert_eq!(info.code, "23P01"),
            other => panic!("expected a user error, got {other:?}"),
        }
    }

    #[test]
    fn schema_from_statement_text() {
        assert_eq!(result_schema("select * from  slots where x = $1").len(), 2);
        assert_eq!(result_schema("INSERT INTO bookings VALUES ($1)").len(), 9);
        assert_eq!(result_schema("INSERT INTO booking_status VALUES ($1, $2)").len(), 9);
        assert!(result_schema("DELETE FROM bookings WHERE id = $1").is_empty());
        assert!(result_schema("INSERT INTO services VALUES ($1)").is_empty());
    }
}
