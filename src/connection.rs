//! Connection state machine.
//!
//! A connection owns its socket exclusively between pool acquire and
//! release. It authenticates with SCRAM-SHA-256, negotiates type
//! descriptors at prepare time, and turns server messages into codec
//! invocations. Logical (server-reported) errors leave the connection
//! usable; framing and I/O errors mark it broken so the pool retires it.

use std::collections::HashMap;

use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::buffer::{Reader, Writer};
use crate::codec::CodecRegistry;
use crate::context::Context;
use crate::descriptor::DescriptorId;
use crate::error::{Error, Result};
use crate::pool::Options;
use crate::protocol::*;
use crate::statement::{PlanCache, PlanKey, PreparedPlan};
use crate::value::Value;

/// A live, authenticated connection.
pub struct Connection {
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,
    read_buffer: BytesMut,
    registry: Arc<CodecRegistry>,
    plans: PlanCache,
    /// Server parameters streamed during the handshake.
    parameters: HashMap<String, String>,
    server_key: [u8; 32],
    tx_state: TxState,
    closed: bool,
    broken: bool,
}

impl Connection {
    /// Establish a TCP connection and run the handshake to `Ready`.
    pub async fn connect(
        ctx: &Context,
        options: &Options,
        registry: Arc<CodecRegistry>,
    ) -> Result<Connection> {
        let addr = format!("{}:{}", options.host, options.port);
        let stream = ctx.run(TcpStream::connect(&addr)).await??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut conn = Connection {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            read_buffer: BytesMut::with_capacity(8192),
            registry,
            plans: PlanCache::new(options.plan_cache_capacity),
            parameters: HashMap::new(),
            server_key: [0; 32],
            tx_state: TxState::Idle,
            closed: false,
            broken: false,
        };

        conn.handshake(ctx, options).await?;
        debug!(host = %options.host, port = options.port, "connection ready");
        Ok(conn)
    }

    async fn handshake(&mut self, ctx: &Context, options: &Options) -> Result<()> {
        self.send(ctx, |w| {
            ClientHandshake {
                user: options.user.clone(),
                database: options.database.clone(),
            }
            .encode(w)
        })
        .await?;

        loop {
            match self.receive_message(ctx).await? {
                ServerMessage::ServerHandshake { major, minor } => {
                    if major != PROTO_VER_MAJOR {
                        return Err(self.fail(Error::Protocol(format!(
                            "server negotiated unsupported protocol version {}.{}",
                            major, minor
                        ))));
                    }
                }
                ServerMessage::Authentication(auth) => match auth {
                    Authentication::Ok => {}
                    Authentication::SaslRequired { methods } => {
                        self.authenticate(ctx, options, &methods).await?;
                    }
                    other => {
                        return Err(self.fail(Error::Protocol(format!(
                            "unexpected authentication message {:?} before SASL start",
                            other
                        ))));
                    }
                },
                ServerMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                ServerMessage::ServerKeyData { data } => {
                    self.server_key = data;
                }
                ServerMessage::ReadyForCommand { tx_state } => {
                    if tx_state != TxState::Idle {
                        return Err(self.fail(Error::Protocol(format!(
                            "fresh connection is not idle: {:?}",
                            tx_state
                        ))));
                    }
                    self.tx_state = tx_state;
                    return Ok(());
                }
                ServerMessage::ErrorResponse {
                    severity,
                    code,
                    message,
                } => {
                    return Err(Error::Server {
                        severity,
                        code,
                        message,
                    });
                }
                other => {
                    trace!(?other, "ignoring message during handshake");
                }
            }
        }
    }

    async fn authenticate(
        &mut self,
        ctx: &Context,
        options: &Options,
        methods: &[String],
    ) -> Result<()> {
        use crate::scram::{ScramClient, MECHANISM};

        if !methods.iter().any(|m| m == MECHANISM) {
            return Err(self.fail(Error::Authentication(format!(
                "server offers no supported SASL method: {:?}",
                methods
            ))));
        }

        let (client, first) = ScramClient::start(&options.user, &options.password);
        self.send(ctx, |w| {
            SaslInitialResponse {
                mechanism: MECHANISM.to_string(),
                data: first.clone(),
            }
            .encode(w)
        })
        .await?;

        let challenge = match self.receive_message(ctx).await? {
            ServerMessage::Authentication(Authentication::SaslContinue { data }) => data,
            ServerMessage::ErrorResponse {
                severity,
                code,
                message,
            } => {
                return Err(Error::Server {
                    severity,
                    code,
                    message,
                })
            }
            other => {
                return Err(self.fail(Error::Protocol(format!(
                    "expected a SASL challenge, got {:?}",
                    other
                ))))
            }
        };

        let (verifier, client_final) = client.challenge(&challenge)?;
        self.send(ctx, |w| SaslResponse { data: client_final.clone() }.encode(w))
            .await?;

        match self.receive_message(ctx).await? {
            ServerMessage::Authentication(Authentication::SaslFinal { data }) => {
                verifier.verify(&data)
            }
            ServerMessage::ErrorResponse {
                severity,
                code,
                message,
            } => Err(Error::Server {
                severity,
                code,
                message,
            }),
            other => Err(self.fail(Error::Protocol(format!(
                "expected the SASL verdict, got {:?}",
                other
            )))),
        }
    }

    // ========================================================================
    // Query flow
    // ========================================================================

    /// Run a query and return its decoded rows, enforcing the requested
    /// cardinality.
    pub async fn query_values(
        &mut self,
        ctx: &Context,
        command: &str,
        args: &[Value],
        expected: Cardinality,
    ) -> Result<Vec<Value>> {
        self.check_usable()?;

        let key = PlanKey {
            command: command.to_string(),
            io_format: IoFormat::Binary,
            expected_cardinality: expected,
        };

        let (plan, fresh) = match self.plans.get(&key) {
            Some(plan) => (plan, false),
            None => {
                let plan = self.prepare(ctx, &key).await?;
                (plan, true)
            }
        };

        let mut rows = self.run_plan(ctx, &key, &plan, args, fresh).await?;

        match expected {
            Cardinality::One if rows.is_empty() => {
                return Err(Error::NoData(format!(
                    "query returned no rows, one was required: {:?}",
                    command
                )))
            }
            Cardinality::One | Cardinality::AtMostOne if rows.len() > 1 => {
                return Err(Error::ResultCardinalityMismatch(format!(
                    "query returned {} rows, at most one was requested: {:?}",
                    rows.len(),
                    command
                )))
            }
            Cardinality::NoResult => rows.clear(),
            _ => {}
        }
        Ok(rows)
    }

    /// Prepare `key.command`, registering any descriptors the registry does
    /// not know yet.
    async fn prepare(&mut self, ctx: &Context, key: &PlanKey) -> Result<Arc<PreparedPlan>> {
        self.send(ctx, |w| {
            Prepare {
                io_format: key.io_format,
                expected_cardinality: key.expected_cardinality,
                statement_name: Vec::new(),
                command: key.command.clone(),
                allow_capabilities: CAPABILITIES_ALL,
            }
            .encode(w)?;
            Sync.encode(w)
        })
        .await?;

        let mut prepared: Option<PreparedPlan> = None;
        let mut server_error: Option<Error> = None;
        loop {
            match self.receive_message(ctx).await? {
                ServerMessage::PrepareComplete {
                    cardinality,
                    input_id,
                    output_id,
                } => {
                    prepared = Some(PreparedPlan {
                        server_cardinality: cardinality,
                        input_id: DescriptorId(input_id),
                        output_id: DescriptorId(output_id),
                    });
                }
                ServerMessage::ReadyForCommand { tx_state } => {
                    self.tx_state = tx_state;
                    break;
                }
                ServerMessage::ErrorResponse {
                    severity,
                    code,
                    message,
                } => {
                    server_error = Some(Error::Server {
                        severity,
                        code,
                        message,
                    });
                }
                other => {
                    trace!(?other, "ignoring message during prepare");
                }
            }
        }
        if let Some(err) = server_error {
            return Err(err);
        }
        let plan = prepared.ok_or_else(|| {
            self.broken = true;
            Error::Protocol("prepare finished without PrepareComplete".to_string())
        })?;

        if !self.registry.contains(plan.input_id) || !self.registry.contains(plan.output_id) {
            self.describe(ctx).await?;
            if !self.registry.contains(plan.input_id) || !self.registry.contains(plan.output_id) {
                return Err(self.fail(Error::Protocol(
                    "describe did not produce the announced descriptors".to_string(),
                )));
            }
        }

        Ok(self.plans.insert(key.clone(), plan))
    }

    /// Fetch and register the full data description of the last prepared
    /// statement.
    async fn describe(&mut self, ctx: &Context) -> Result<()> {
        self.send(ctx, |w| {
            DescribeStatement {
                aspect: ASPECT_DATA_DESCRIPTION,
                statement_name: Vec::new(),
            }
            .encode(w)?;
            Sync.encode(w)
        })
        .await?;

        let mut server_error: Option<Error> = None;
        loop {
            match self.receive_message(ctx).await? {
                ServerMessage::CommandDataDescription {
                    input_typedesc,
                    output_typedesc,
                    ..
                } => {
                    self.register_descriptors(&input_typedesc, &output_typedesc)?;
                }
                ServerMessage::ReadyForCommand { tx_state } => {
                    self.tx_state = tx_state;
                    break;
                }
                ServerMessage::ErrorResponse {
                    severity,
                    code,
                    message,
                } => {
                    server_error = Some(Error::Server {
                        severity,
                        code,
                        message,
                    });
                }
                other => {
                    trace!(?other, "ignoring message during describe");
                }
            }
        }
        match server_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn register_descriptors(&mut self, input: &[u8], output: &[u8]) -> Result<()> {
        if !input.is_empty() {
            self.registry.build_and_register(input)?;
        }
        if !output.is_empty() {
            self.registry.build_and_register(output)?;
        }
        Ok(())
    }

    /// Execute a plan. Fresh plans go through `Execute` against the
    /// just-prepared unnamed statement; cached plans use
    /// `OptimisticExecute`, re-registering descriptors and retrying once if
    /// the server reports the plan stale.
    async fn run_plan(
        &mut self,
        ctx: &Context,
        key: &PlanKey,
        plan: &PreparedPlan,
        args: &[Value],
        fresh: bool,
    ) -> Result<Vec<Value>> {
        let mut input_id = plan.input_id;
        let mut output_id = plan.output_id;
        let mut optimistic = !fresh;

        for _ in 0..2 {
            let input_codec = self.registry.lookup(input_id).ok_or_else(|| {
                Error::Protocol(format!("argument descriptor {} is not registered", input_id))
            })?;
            let output_codec = self.registry.lookup(output_id).ok_or_else(|| {
                Error::Protocol(format!("result descriptor {} is not registered", output_id))
            })?;
            let arguments = input_codec.encode_args(args)?;

            if optimistic {
                let message = OptimisticExecute {
                    io_format: key.io_format,
                    expected_cardinality: key.expected_cardinality,
                    command: key.command.clone(),
                    input_id: input_id.0,
                    output_id: output_id.0,
                    arguments,
                };
                self.send(ctx, |w| {
                    message.encode(w)?;
                    Sync.encode(w)
                })
                .await?;
            } else {
                let message = Execute {
                    statement_name: Vec::new(),
                    arguments,
                };
                self.send(ctx, |w| {
                    message.encode(w)?;
                    Sync.encode(w)
                })
                .await?;
            }

            let mut rows = Vec::new();
            let mut server_error: Option<Error> = None;
            let mut stale: Option<(DescriptorId, DescriptorId)> = None;
            loop {
                match self.receive_message(ctx).await? {
                    ServerMessage::Data { elements } => {
                        for element in &elements {
                            rows.push(output_codec.decode_root(element)?);
                        }
                    }
                    ServerMessage::CommandDataDescription {
                        input_id: new_input,
                        input_typedesc,
                        output_id: new_output,
                        output_typedesc,
                        ..
                    } => {
                        // the cached descriptor ids went stale; register the
                        // fresh ones and re-run
                        self.register_descriptors(&input_typedesc, &output_typedesc)?;
                        stale = Some((
                            DescriptorId(new_input),
                            DescriptorId(new_output),
                        ));
                    }
                    ServerMessage::CommandComplete { status } => {
                        trace!(%status, "command complete");
                    }
                    ServerMessage::ReadyForCommand { tx_state } => {
                        self.tx_state = tx_state;
                        break;
                    }
                    ServerMessage::ErrorResponse {
                        severity,
                        code,
                        message,
                    } => {
                        server_error = Some(Error::Server {
                            severity,
                            code,
                            message,
                        });
                    }
                    other => {
                        trace!(?other, "ignoring message during execute");
                    }
                }
            }
            if let Some(err) = server_error {
                return Err(err);
            }

            match stale {
                Some((new_input, new_output)) => {
                    self.plans.remove(key);
                    self.plans.insert(
                        key.clone(),
                        PreparedPlan {
                            server_cardinality: plan.server_cardinality,
                            input_id: new_input,
                            output_id: new_output,
                        },
                    );
                    input_id = new_input;
                    output_id = new_output;
                    optimistic = true;
                    continue;
                }
                None => return Ok(rows),
            }
        }

        Err(self.fail(Error::Protocol(
            "server kept invalidating the prepared plan".to_string(),
        )))
    }

    /// Run a bare script, discarding any results.
    pub async fn execute_script(&mut self, ctx: &Context, script: &str) -> Result<()> {
        self.check_usable()?;
        self.send(ctx, |w| {
            ExecuteScript {
                script: script.to_string(),
            }
            .encode(w)
        })
        .await?;

        let mut server_error: Option<Error> = None;
        loop {
            match self.receive_message(ctx).await? {
                ServerMessage::CommandComplete { .. } | ServerMessage::Data { .. } => {}
                ServerMessage::ReadyForCommand { tx_state } => {
                    self.tx_state = tx_state;
                    break;
                }
                ServerMessage::ErrorResponse {
                    severity,
                    code,
                    message,
                } => {
                    server_error = Some(Error::Server {
                        severity,
                        code,
                        message,
                    });
                }
                other => {
                    trace!(?other, "ignoring message during script");
                }
            }
        }
        match server_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Start a transaction. Nested transactions are refused.
    pub async fn begin(&mut self, ctx: &Context) -> Result<()> {
        if self.tx_state != TxState::Idle {
            return Err(Error::Interface(
                "cannot start a transaction while one is in progress".to_string(),
            ));
        }
        self.execute_script(ctx, "START TRANSACTION").await
    }

    pub async fn commit(&mut self, ctx: &Context) -> Result<()> {
        self.execute_script(ctx, "COMMIT").await
    }

    pub async fn rollback(&mut self, ctx: &Context) -> Result<()> {
        self.execute_script(ctx, "ROLLBACK").await
    }

    pub fn tx_state(&self) -> TxState {
        self.tx_state
    }

    /// Key streamed in ServerKeyData; identifies this session to the
    /// server's out-of-band surfaces.
    pub fn server_key(&self) -> [u8; 32] {
        self.server_key
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    pub fn is_healthy(&self) -> bool {
        !self.closed && !self.broken
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Get a server parameter streamed during the handshake.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Send Terminate and close. Best-effort: the socket may already be
    /// gone.
    pub async fn terminate(&mut self, ctx: &Context) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.broken {
            return;
        }
        let _ = self.send(ctx, |w| Terminate.encode(w)).await;
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Interface("connection is closed".to_string()));
        }
        if self.broken {
            return Err(Error::Interface("connection is broken".to_string()));
        }
        Ok(())
    }

    /// Record errors that ruin the connection for further use.
    fn fail(&mut self, err: Error) -> Error {
        if err.breaks_connection() {
            self.broken = true;
        }
        err
    }

    // ========================================================================
    // Wire primitives
    // ========================================================================

    /// Encode one or more messages and flush them in a single write.
    async fn send<F>(&mut self, ctx: &Context, encode: F) -> Result<()>
    where
        F: FnOnce(&mut Writer) -> Result<()>,
    {
        let mut w = Writer::new();
        encode(&mut w)?;
        let write = async {
            self.writer.write_all(w.as_slice()).await?;
            self.writer.flush().await
        };
        match ctx.run(write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.fail(Error::Io(e))),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Read one framed message, buffering partial reads. Server log
    /// messages are traced and skipped here so state machines never see
    /// them.
    async fn receive_message(&mut self, ctx: &Context) -> Result<ServerMessage> {
        loop {
            if self.read_buffer.len() >= 5 {
                let len = u32::from_be_bytes(
                    self.read_buffer[1..5].try_into().expect("4-byte slice"),
                ) as usize;
                let total = 1 + len;
                if self.read_buffer.len() >= total {
                    let frame = self.read_buffer.split_to(total).freeze();
                    let mut r = Reader::new(frame);
                    let msg = r
                        .next_message()
                        .and_then(|_| ServerMessage::decode(&mut r));
                    match msg {
                        Ok(ServerMessage::LogMessage {
                            severity,
                            code,
                            text,
                        }) => {
                            debug!(severity, code, %text, "server log message");
                            continue;
                        }
                        Ok(msg) => return Ok(msg),
                        Err(e) => return Err(self.fail(e)),
                    }
                }
            }

            let read = self.reader.read_buf(&mut self.read_buffer);
            let n = match ctx.run(read).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(self.fail(Error::Io(e))),
                Err(e) => return Err(self.fail(e)),
            };
            if n == 0 {
                return Err(self.fail(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ))));
            }
        }
    }
}
