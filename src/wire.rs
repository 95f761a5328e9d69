use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::RoostAuthSource;
use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command, ResultSet};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = RoostFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct RoostHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RoostQueryParser>,
}

impl RoostHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RoostQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            tracing::error!("tenant {db:?} unavailable: {e}");
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    /// Run one command, recording RED metrics and logging rejections.
    /// Result columns are encoded per `format`.
    async fn execute_command(&self, engine: &Engine, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        debug!(command = label, "execute");

        let result = self.dispatch(engine, cmd, format).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(ref e) = result {
            debug!(command = label, "rejected: {e}");
        }
        result
    }

    async fn dispatch(&self, engine: &Engine, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let result_set = (cmd.result_set(), format);
        match cmd {
            Command::InsertUser { id, user } => {
                engine.register_user(id, user).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertProperty { id, owner_id, property } => {
                engine
                    .create_property(id, owner_id, property)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateProperty { id, owner_id, update } => {
                engine
                    .update_property(id, owner_id, update)
                    .await
                    .map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::InsertPropertyImage {
                property_id,
                owner_id,
                url,
            } => {
                engine
                    .add_property_image(property_id, owner_id, url)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertBooking {
                id,
                property_id,
                guest_id,
                start,
                end,
                returning,
            } => {
                let booking = match engine.create_booking(id, property_id, guest_id, start, end).await {
                    Ok(b) => {
                        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
                        b
                    }
                    Err(e) => {
                        if let EngineError::Conflict(existing) = e {
                            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                            debug!(%property_id, %existing, "booking refused, dates taken");
                        }
                        return Err(engine_err(e));
                    }
                };
                if returning {
                    rows(result_set, vec![booking], encode_booking)
                } else {
                    Ok(inserted(1))
                }
            }
            Command::UpdateBookingStatus { id, actor_id, status } => {
                engine
                    .set_booking_status(id, actor_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::SelectProperty { id } => {
                let property = engine.get_property(&id).await.map_err(engine_err)?;
                rows(result_set, vec![property], encode_property)
            }
            Command::SelectProperties { filter } => {
                let properties = engine.list_properties(&filter).await;
                rows(result_set, properties, encode_property)
            }
            Command::SelectPropertyDetail {
                property_id,
                owner_id,
            } => {
                let detail = engine
                    .owner_property_detail(property_id, owner_id, now_ms())
                    .await
                    .map_err(engine_err)?;
                rows(result_set, vec![detail], encode_property_detail)
            }
            Command::SelectPropertyBookings {
                property_id,
                owner_id,
            } => {
                let detail = engine
                    .owner_property_detail(property_id, owner_id, now_ms())
                    .await
                    .map_err(engine_err)?;
                rows(result_set, detail.booking_history, encode_owner_booking)
            }
            Command::SelectGuestBookings { guest_id } => {
                let summary = engine
                    .guest_booking_summary(guest_id, now_ms())
                    .await
                    .map_err(engine_err)?;
                rows(result_set, summary.bookings, encode_guest_booking)
            }
            Command::SelectGuestStatistics { guest_id } => {
                let summary = engine
                    .guest_booking_summary(guest_id, now_ms())
                    .await
                    .map_err(engine_err)?;
                rows(result_set, vec![summary.statistics], encode_stats)
            }
            Command::SelectDashboard { user_id } => {
                let dashboard = engine.dashboard(user_id, now_ms()).await.map_err(engine_err)?;
                rows(result_set, dashboard_rows(dashboard), encode_dashboard_row)
            }
        }
    }
}

fn inserted(n: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(n))
}

fn updated(n: usize) -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(n))
}

// ── Result schemas ───────────────────────────────────────────────

type Columns = Vec<(&'static str, Type)>;

/// `images` is a JSON array of URLs.
fn property_columns() -> Columns {
    vec![
        ("id", Type::VARCHAR),
        ("owner_id", Type::VARCHAR),
        ("name", Type::VARCHAR),
        ("description", Type::VARCHAR),
        ("location", Type::VARCHAR),
        ("price", Type::FLOAT8),
        ("amenities", Type::VARCHAR),
        ("images", Type::VARCHAR),
    ]
}

fn stats_columns(viewer: Viewer) -> Columns {
    vec![
        ("total_bookings", Type::INT8),
        (viewer.amount_label(), Type::FLOAT8),
        ("upcoming_bookings", Type::INT8),
    ]
}

fn columns(result_set: ResultSet) -> Columns {
    match result_set {
        ResultSet::None => vec![],
        ResultSet::Properties => property_columns(),
        ResultSet::Bookings => vec![
            ("id", Type::VARCHAR),
            ("property_id", Type::VARCHAR),
            ("guest_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("status", Type::VARCHAR),
            ("total_price", Type::FLOAT8),
        ],
        ResultSet::PropertyDetail => {
            let mut cols = property_columns();
            cols.push(("is_available", Type::BOOL));
            cols.push(("next_available_date", Type::INT8));
            cols.extend(stats_columns(Viewer::Owner));
            cols
        }
        ResultSet::PropertyBookings => vec![
            ("booking_id", Type::VARCHAR),
            ("guest_id", Type::VARCHAR),
            ("guest_name", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("status", Type::VARCHAR),
            ("total_price", Type::FLOAT8),
        ],
        ResultSet::GuestBookings => vec![
            ("booking_id", Type::VARCHAR),
            ("property_id", Type::VARCHAR),
            ("property_name", Type::VARCHAR),
            ("property_description", Type::VARCHAR),
            ("location", Type::VARCHAR),
            ("price", Type::FLOAT8),
            ("amenities", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("status", Type::VARCHAR),
            ("total_price", Type::FLOAT8),
        ],
        ResultSet::GuestStatistics => stats_columns(Viewer::Guest),
        ResultSet::Dashboard => vec![
            ("role", Type::VARCHAR),
            ("property_id", Type::VARCHAR),
            ("property_name", Type::VARCHAR),
            ("booking_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("status", Type::VARCHAR),
            ("total_price", Type::FLOAT8),
            ("is_available", Type::BOOL),
            ("next_available_date", Type::INT8),
            ("total_bookings", Type::INT8),
            ("total_amount", Type::FLOAT8),
            ("upcoming_bookings", Type::INT8),
        ],
    }
}

/// Column layout for a result shape, each column in the format the client
/// asked for. Times are Unix milliseconds.
pub fn schema_for(result_set: ResultSet, format: &Format) -> Vec<FieldInfo> {
    columns(result_set)
        .into_iter()
        .enumerate()
        .map(|(idx, (name, ty))| FieldInfo::new(name.into(), None, None, ty, format.format_for(idx)))
        .collect()
}

// ── Row encoding ─────────────────────────────────────────────────

fn rows<T, F>((result_set, format): (ResultSet, &Format), items: Vec<T>, encode: F) -> PgWireResult<Response>
where
    F: Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
{
    let schema = Arc::new(schema_for(result_set, format));
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

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn encode_property(encoder: &mut DataRowEncoder, p: Property) -> PgWireResult<()> {
    let images = serde_json::to_string(&p.images).map_err(|e| PgWireError::ApiError(Box::new(e)))?;
    encoder.encode_field(&p.id.to_string())?;
    encoder.encode_field(&p.owner_id.to_string())?;
    encoder.encode_field(&p.name)?;
    encoder.encode_field(&p.description)?;
    encoder.encode_field(&p.location)?;
    encoder.encode_field(&p.price)?;
    encoder.encode_field(&p.amenities)?;
    encoder.encode_field(&images)
}

fn encode_booking(encoder: &mut DataRowEncoder, b: Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.property_id.to_string())?;
    encoder.encode_field(&b.guest_id.to_string())?;
    encoder.encode_field(&b.span.start)?;
    encoder.encode_field(&b.span.end)?;
    encoder.encode_field(&b.status.to_string())?;
    encoder.encode_field(&b.total_price)
}

fn encode_stats(encoder: &mut DataRowEncoder, s: BookingStats) -> PgWireResult<()> {
    encoder.encode_field(&count(s.total_bookings))?;
    encoder.encode_field(&s.total_amount)?;
    encoder.encode_field(&count(s.upcoming_bookings))
}

fn encode_property_detail(encoder: &mut DataRowEncoder, d: OwnerPropertyDetail) -> PgWireResult<()> {
    encode_property(encoder, d.property)?;
    encoder.encode_field(&d.availability.is_available)?;
    encoder.encode_field(&d.availability.next_available_date)?;
    encode_stats(encoder, d.statistics)
}

fn encode_owner_booking(encoder: &mut DataRowEncoder, b: OwnerBookingView) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.guest_id.to_string())?;
    encoder.encode_field(&b.guest_name)?;
    encoder.encode_field(&b.start)?;
    encoder.encode_field(&b.end)?;
    encoder.encode_field(&b.status.to_string())?;
    encoder.encode_field(&b.total_price)
}

fn encode_guest_booking(encoder: &mut DataRowEncoder, b: GuestBookingView) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.property.id.to_string())?;
    encoder.encode_field(&b.property.name)?;
    encoder.encode_field(&b.property.description)?;
    encoder.encode_field(&b.property.location)?;
    encoder.encode_field(&b.property.price)?;
    encoder.encode_field(&b.property.amenities)?;
    encoder.encode_field(&b.start)?;
    encoder.encode_field(&b.end)?;
    encoder.encode_field(&b.status.to_string())?;
    encoder.encode_field(&b.total_price)
}

/// One line of the dashboard table. Owners get a row per property; guests
/// get a statistics row followed by a row per booking. Columns that do not
/// apply are NULL.
#[derive(Debug, Default, PartialEq)]
struct DashboardRow {
    role: String,
    property_id: Option<String>,
    property_name: Option<String>,
    booking_id: Option<String>,
    start: Option<Ms>,
    end: Option<Ms>,
    status: Option<String>,
    total_price: Option<f64>,
    availability: Option<AvailabilitySnapshot>,
    statistics: Option<BookingStats>,
}

fn dashboard_rows(dashboard: Dashboard) -> Vec<DashboardRow> {
    match dashboard {
        Dashboard::Owner { properties } => properties
            .into_iter()
            .map(|o| DashboardRow {
                role: Role::Owner.to_string(),
                property_id: Some(o.property.id.to_string()),
                property_name: Some(o.property.name),
                availability: Some(o.availability),
                statistics: Some(o.statistics),
                ..Default::default()
            })
            .collect(),
        Dashboard::Guest { bookings, statistics } => {
            let mut out = Vec::with_capacity(bookings.len() + 1);
            out.push(DashboardRow {
                role: Role::Guest.to_string(),
                statistics: Some(statistics),
                ..Default::default()
            });
            out.extend(bookings.into_iter().map(|b| DashboardRow {
                role: Role::Guest.to_string(),
                property_id: Some(b.property.id.to_string()),
                property_name: Some(b.property.name),
                booking_id: Some(b.id.to_string()),
                start: Some(b.start),
                end: Some(b.end),
                status: Some(b.status.to_string()),
                total_price: Some(b.total_price),
                ..Default::default()
            }));
            out
        }
    }
}

fn encode_dashboard_row(encoder: &mut DataRowEncoder, row: DashboardRow) -> PgWireResult<()> {
    encoder.encode_field(&row.role)?;
    encoder.encode_field(&row.property_id)?;
    encoder.encode_field(&row.property_name)?;
    encoder.encode_field(&row.booking_id)?;
    encoder.encode_field(&row.start)?;
    encoder.encode_field(&row.end)?;
    encoder.encode_field(&row.status)?;
    encoder.encode_field(&row.total_price)?;
    encoder.encode_field(&row.availability.map(|a| a.is_available))?;
    encoder.encode_field(&row.availability.and_then(|a| a.next_available_date))?;
    encoder.encode_field(&row.statistics.map(|s| count(s.total_bookings)))?;
    encoder.encode_field(&row.statistics.map(|s| s.total_amount))?;
    encoder.encode_field(&row.statistics.map(|s| count(s.upcoming_bookings)))
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for RoostHandler {
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
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute_command(&engine, cmd, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoostQueryParser;

#[async_trait]
impl QueryParser for RoostQueryParser {
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
        Ok(describe_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

/// Result columns of a statement before its parameters are bound. A
/// statement that does not parse describes as no columns; the error is
/// reported when it executes.
fn describe_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    sql::describe(sql)
        .map(|result_set| schema_for(result_set, format))
        .unwrap_or_default()
}

#[async_trait]
impl ExtendedQueryHandler for RoostHandler {
    type Statement = String;
    type QueryParser = RoostQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute_command(&engine, cmd, &portal.result_column_format)
            .await
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
            describe_schema(&target.statement, &Format::UnifiedText),
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
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
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
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Runs highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

fn substitute<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoostFactory {
    handler: Arc<RoostHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RoostAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoostFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = RoostAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoostHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoostFactory {
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

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::Forbidden(_) => "42501",
        EngineError::Validation(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(ref msg) = e {
        tracing::error!("WAL write failed: {msg}");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
