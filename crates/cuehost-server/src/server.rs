//! The request loop.
//!
//! ```text
//! stdin ─► reader thread ─► dispatch ─┬─► pool (catalog, loadPlugin)
//!                                      └─► sequencer ─► pool (per handle)
//!                      pool, event pump ─► writer thread ─► stdout
//! ```
//!
//! EOF and `shutdown` end the loop cleanly: in-flight commands finish,
//! every instance is unloaded, and pending output is flushed. A host fault
//! (a panicking command, a broken stdout) ends it with an error.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender, select};
use cuehost_isolation::ProbeRunner;
use cuehost_session::{
    Catalog, HostEvent, HostFactory, InProcessProber, IsolationMode, PluginFactory, Prober,
    SubprocessProber,
};
use serde_json::{Value, json};

use crate::commands::{Command, HostContext, execute};
use crate::config::HostConfig;
use crate::events::EventPump;
use crate::pool::{Spawner, WorkerPool};
use crate::protocol::{ErrorCode, Outcome, Outgoing, ProtocolError, RequestId, parse_request};
use crate::sequencer::Sequencer;
use crate::transport::{self, Line};

pub struct Server {
    ctx: Arc<HostContext>,
    events: Receiver<HostEvent>,
}

impl Server {
    /// A host using the configured isolation mode for scanning and loading.
    pub fn new(config: HostConfig) -> Self {
        let prober: Box<dyn Prober> = match config.isolation {
            IsolationMode::Subprocess => Box::new(SubprocessProber(ProbeRunner::new(
                config.probe_exe(),
                config.probe_timeout(),
            ))),
            IsolationMode::InProcess => Box::new(InProcessProber),
        };
        let catalog = Catalog::new(prober, config.builtins);
        let factory = HostFactory::new(
            config.isolation,
            config.worker_exe(),
            config.request_timeout(),
        );
        Self::with_parts(config, catalog, Box::new(factory))
    }

    pub fn with_parts(
        config: HostConfig,
        catalog: Catalog,
        factory: Box<dyn PluginFactory>,
    ) -> Self {
        let (tx, events) = crossbeam_channel::unbounded();
        let ctx = HostContext {
            config,
            catalog,
            registry: cuehost_session::Registry::new(),
            factory,
            events: tx,
        };
        Self {
            ctx: Arc::new(ctx),
            events,
        }
    }

    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    /// Serve requests from `input` until EOF or `shutdown`.
    pub fn run<R, W>(self, input: R, output: W) -> anyhow::Result<()>
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        let Self { ctx, events } = self;
        let (out, out_rx) = crossbeam_channel::unbounded::<Outgoing>();
        let (fatal_tx, fatal) = crossbeam_channel::unbounded::<String>();

        let writer = transport::spawn_writer(output, out_rx, fatal_tx.clone())
            .context("Failed to start output writer")?;
        let pool = WorkerPool::new(ctx.config.workers, &fatal_tx)
            .context("Failed to start command pool")?;
        drop(fatal_tx);
        let pump = EventPump::start(
            Arc::clone(&ctx),
            events,
            out.clone(),
            ctx.config.event_poll_interval(),
        )
        .context("Failed to start event pump")?;
        let lines = transport::spawn_reader(input).context("Failed to start input reader")?;

        tracing::info!(
            "Serving requests ({} workers, {:?} isolation, {} plugins known)",
            ctx.config.workers,
            ctx.config.isolation,
            ctx.catalog.len()
        );

        let dispatcher = Dispatcher {
            ctx: Arc::clone(&ctx),
            out: out.clone(),
            spawner: pool.spawner(),
            sequencer: Sequencer::new(pool.spawner()),
        };

        let mut shutdown_id = None;
        let mut failure = None;
        loop {
            select! {
                recv(lines) -> line => match line {
                    Ok(Ok(line)) => {
                        if let Some(id) = dispatcher.dispatch(line) {
                            shutdown_id = Some(id);
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        failure = Some(format!("input read failed: {e}"));
                        break;
                    }
                    Err(_) => {
                        tracing::info!("Controller closed input");
                        break;
                    }
                },
                recv(fatal) -> message => {
                    failure = Some(message.unwrap_or_else(|_| "host fault".to_string()));
                    break;
                }
            }
        }

        if let Some(failure) = failure {
            // Workers notice the closed pipe and exit on their own.
            tracing::error!("Host failure: {failure}");
            anyhow::bail!(failure);
        }

        pool.wait_idle();
        ctx.registry.unload_all();
        if let Some(id) = shutdown_id {
            let _ = out.send(Outgoing::response(id, Outcome::Result(json!({}))));
        }
        pump.stop();

        drop(dispatcher);
        pool.shutdown();
        drop(out);
        let _ = writer.join();

        if let Ok(failure) = fatal.try_recv() {
            anyhow::bail!(failure);
        }
        tracing::info!("Host stopped");
        Ok(())
    }
}

struct Dispatcher {
    ctx: Arc<HostContext>,
    out: Sender<Outgoing>,
    spawner: Spawner,
    sequencer: Arc<Sequencer>,
}

impl Dispatcher {
    /// Route one line. Returns the request id when it is `shutdown`.
    fn dispatch(&self, line: Line) -> Option<RequestId> {
        let text = match line {
            Line::Text(text) => text,
            Line::Invalid(reason) => {
                self.reply_error(
                    Value::Null,
                    ProtocolError::new(ErrorCode::ParseError, format!("Invalid UTF-8: {reason}")),
                );
                return None;
            }
        };

        let request = match parse_request(&text) {
            Ok(request) => request,
            Err(rejected) => {
                tracing::warn!("Rejected request line: {}", rejected.error);
                self.reply_error(rejected.id, rejected.error);
                return None;
            }
        };
        tracing::debug!("Request {}: {}", request.id, request.command);

        let command = match Command::parse(&request.command, request.params) {
            Ok(command) => command,
            Err(error) => {
                self.reply_error(request.id, error);
                return None;
            }
        };
        if command == Command::Shutdown {
            return Some(request.id);
        }

        let handle = command.handle();
        let ctx = Arc::clone(&self.ctx);
        let out = self.out.clone();
        let id = request.id;
        let job = move || {
            let outcome = execute(&ctx, command);
            if let Err(error) = &outcome {
                tracing::debug!("Request {id} failed: {error}");
            }
            let _ = out.send(Outgoing::response(id, outcome));
        };

        match handle {
            Some(handle) => self.sequencer.submit(handle, Box::new(job)),
            None => {
                self.spawner.spawn(job);
            }
        }
        None
    }

    fn reply_error(&self, id: RequestId, error: ProtocolError) {
        let _ = self.out.send(Outgoing::error(id, error));
    }
}
