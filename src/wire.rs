use std::fmt::Debug;
use std::io;
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

use crate::auth::InnkeepAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, Relation, SqlError};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = InnkeepFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct InnkeepHandler {
    engine: Arc<Engine>,
    query_parser: Arc<InnkeepQueryParser>,
}

impl InnkeepHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(InnkeepQueryParser),
        }
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertRooms { rooms } => {
                // Rows are applied one by one; a failing row leaves earlier rows in place.
                let count = rooms.len();
                for room in rooms {
                    self.engine.create_room(room).await.map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::InsertReservation {
                room_id,
                checkin,
                checkout,
                total_charge,
                returning,
            } => {
                let reservation = self
                    .engine
                    .create_reservation(&room_id, checkin, checkout, total_charge)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    Ok(reservation_rows(vec![reservation]))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::SelectAvailableRooms {
                start,
                end,
                min_beds,
                allow_smoking,
            } => {
                let found = self
                    .engine
                    .find_available_rooms(start, end, min_beds, allow_smoking)
                    .await
                    .map_err(engine_err)?;
                Ok(available_room_rows(found))
            }
            Command::SelectReservations { id, filter } => {
                let found = match id {
                    Some(id) => match self.engine.get_reservation(id).await {
                        Ok(r) if filter.matches(&r) => vec![r],
                        Ok(_) | Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => self.engine.find_reservations(&filter).await,
                };
                Ok(reservation_rows(found))
            }
            Command::SelectRooms { id } => {
                let rooms = match id {
                    Some(id) => match self.engine.get_room(&id).await {
                        Ok(room) => vec![room],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => self.engine.list_rooms().await,
                };
                Ok(room_rows(rooms))
            }
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn room_fields() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("num_beds", Type::INT4),
        field("allow_smoking", Type::BOOL),
        field("daily_rate", Type::NUMERIC),
        field("cleaning_fee", Type::NUMERIC),
    ]
}

fn available_room_fields() -> Vec<FieldInfo> {
    let mut fields = room_fields();
    fields.push(field("total_charge", Type::NUMERIC));
    fields
}

fn reservation_fields() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("checkin_date", Type::DATE),
        field("checkout_date", Type::DATE),
        field("total_charge", Type::NUMERIC),
    ]
}

fn relation_fields(relation: Option<Relation>) -> Vec<FieldInfo> {
    match relation {
        Some(Relation::Rooms) => room_fields(),
        Some(Relation::AvailableRooms) => available_room_fields(),
        Some(Relation::Reservations) => reservation_fields(),
        None => Vec::new(),
    }
}

fn encode_room(encoder: &mut DataRowEncoder, room: &Room) -> PgWireResult<()> {
    encoder.encode_field(&room.id)?;
    encoder.encode_field(&(room.num_beds as i32))?;
    encoder.encode_field(&room.allow_smoking)?;
    encoder.encode_field(&room.daily_rate.to_string())?;
    encoder.encode_field(&room.cleaning_fee.to_string())
}

fn room_rows(rooms: Vec<Room>) -> Response {
    let schema = Arc::new(room_fields());
    let rows: Vec<PgWireResult<_>> = rooms
        .iter()
        .map(|room| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_room(&mut encoder, room)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn available_room_rows(found: Vec<AvailableRoom>) -> Response {
    let schema = Arc::new(available_room_fields());
    let rows: Vec<PgWireResult<_>> = found
        .iter()
        .map(|candidate| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_room(&mut encoder, &candidate.room)?;
            encoder.encode_field(&candidate.total_charge.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservation_rows(reservations: Vec<Reservation>) -> Response {
    let schema = Arc::new(reservation_fields());
    let rows: Vec<PgWireResult<_>> = reservations
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.room_id)?;
            encoder.encode_field(&r.stay.checkin().to_string())?;
            encoder.encode_field(&r.stay.checkout().to_string())?;
            encoder.encode_field(&r.total_charge.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for InnkeepHandler {
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
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        if commands.is_empty() {
            return Ok(vec![Response::EmptyQuery]);
        }
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.execute_command(cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InnkeepQueryParser;

#[async_trait]
impl QueryParser for InnkeepQueryParser {
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
        Ok(vec![Type::VARCHAR; sql::parameter_count(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(relation_fields(sql::statement_relation(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for InnkeepHandler {
    type Statement = String;
    type QueryParser = InnkeepQueryParser;

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
        let params = bound_parameters(portal)?;
        let cmd = sql::parse_sql_with_params(&portal.statement.statement, &params).map_err(sql_err)?;
        self.execute_command(cmd).await
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
        let param_types = vec![Type::VARCHAR; sql::parameter_count(&target.statement)];
        let fields = relation_fields(sql::statement_relation(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        let fields = relation_fields(sql::statement_relation(&target.statement.statement));
        Ok(DescribePortalResponse::new(fields))
    }
}

/// Bound parameter values as text. Every parameter is declared VARCHAR, so text
/// and binary encodings carry the same UTF-8 bytes.
fn bound_parameters(portal: &Portal<String>) -> PgWireResult<Vec<Option<String>>> {
    portal
        .parameters
        .iter()
        .enumerate()
        .map(|(i, p)| p.as_deref().map(|bytes| decode_parameter(i + 1, bytes)).transpose())
        .collect()
}

fn decode_parameter(position: usize, bytes: &[u8]) -> PgWireResult<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| user_error("22021", format!("parameter ${position} is not valid UTF-8: {e}")))
}

// ── Factory ──────────────────────────────────────────────────────

pub struct InnkeepFactory {
    handler: Arc<InnkeepHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<InnkeepAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl InnkeepFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = InnkeepAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(InnkeepHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnkeepFactory {
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

// ── Error mapping ────────────────────────────────────────────────

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidDateRange { .. } => "22007",
        EngineError::Validation(_) => "22023",
        EngineError::RoomNotAvailable { .. } => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::DataAccess(_) => "58030",
    }
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::BadValue { .. } => "22P02",
        SqlError::TooLong(_) => "54000",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn { .. } => "42703",
        SqlError::MissingParameter(_) => "08P01",
        SqlError::Unsupported(_) | SqlError::UnsupportedFilter(_) => "0A000",
        SqlError::Parse(_)
        | SqlError::Empty
        | SqlError::WrongArity(..)
        | SqlError::MissingColumn(_)
        | SqlError::MissingFilter(_) => "42601",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::DataAccess(_) = e {
        tracing::error!("query failed: {e}");
    }
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}
