//! Server orchestrator
//!
//! Drives the strict initialization order that turns a set of processors
//! into a registered, discoverable instance: build the publisher, bring up
//! logging and the backdoor, take the leader lock when asked, run the
//! application init, install tracing, bind and publish the processors, then
//! block on signals.

use crate::binder::{self, Driver, EngineHandle, Processor};
use crate::config::CoordConfig;
use crate::registry::types::{self, PROC_BACKDOOR, PROC_METRICS};
use crate::registry::{ServBase, ServInfo};
use crate::telemetry::{LogOptions, Telemetry, LOG_DIR_CONSOLE};
use crate::{Error, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{error, info, warn};

/// Deployment model of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerModel {
    /// Every instance serves traffic.
    Server,
    /// Only the elected leader serves; followers park on the lock.
    MasterSlave,
}

/// Named processors supplied by the application. `BTreeMap` keeps the
/// binding order deterministic.
pub type ProcessorMap = BTreeMap<String, Arc<dyn Processor>>;

/// Command-line flags of a rookery-hosted service.
#[derive(Parser, Debug)]
#[command(author, version, about = "rookery-hosted service", long_about = None)]
struct CmdArgs {
    /// Service location, `group/service`
    #[arg(long)]
    serv: String,

    /// Service session key
    #[arg(long)]
    skey: String,

    /// Log directory; `console` keeps stdout
    #[arg(long, default_value = "")]
    logdir: String,

    /// Maximum size in megabytes of one log file
    #[arg(long, default_value_t = 0)]
    logmaxsize: u64,

    /// Maximum number of old log files to retain
    #[arg(long, default_value_t = 0)]
    logmaxbackups: u64,

    /// Slot id offset for data-center disambiguation
    #[arg(long, default_value_t = 0)]
    sidoffset: i32,

    /// Service group
    #[arg(long, default_value = "")]
    group: String,

    /// Start with routing disabled
    #[arg(long)]
    disable: bool,
}

/// Resolved startup arguments; built from the command line by the `serve`
/// entry points or directly by test harnesses.
#[derive(Debug, Clone, Default)]
pub struct ServerArgs {
    pub serv_location: String,
    pub session_key: String,
    pub log: LogOptions,
    pub sid_offset: i32,
    pub group: String,
    pub disable: bool,
}

impl From<CmdArgs> for ServerArgs {
    fn from(args: CmdArgs) -> Self {
        Self {
            serv_location: args.serv,
            session_key: args.skey,
            log: LogOptions {
                dir: args.logdir,
                max_size_mb: args.logmaxsize,
                max_backups: args.logmaxbackups,
                level: String::new(),
            },
            sid_offset: args.sidoffset,
            group: args.group,
            disable: args.disable,
        }
    }
}

/// Process-lifetime orchestrator value. Library entry points are thin
/// facades over one lazily initialized instance; embedding code may also
/// construct and drive its own.
pub struct Server {
    sbase: Mutex<Option<Arc<ServBase>>>,
    engines: Mutex<HashMap<String, EngineHandle>>,
    telemetry: Mutex<Option<Telemetry>>,
    started: Instant,
}

impl Server {
    pub fn new() -> Self {
        Self {
            sbase: Mutex::new(None),
            engines: Mutex::new(HashMap::new()),
            telemetry: Mutex::new(None),
            started: Instant::now(),
        }
    }

    /// Parse command-line flags and run until terminated.
    pub async fn serve<F, Fut>(
        &self,
        cfg: CoordConfig,
        init_fn: F,
        procs: ProcessorMap,
    ) -> Result<()>
    where
        F: FnOnce(Arc<ServBase>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let args = ServerArgs::from(CmdArgs::parse());
        self.run(cfg, args, ServerModel::Server, init_fn, procs).await
    }

    /// Leader/follower variant of [`serve`](Server::serve): only the lock
    /// holder publishes and serves.
    pub async fn master_slave<F, Fut>(
        &self,
        cfg: CoordConfig,
        init_fn: F,
        procs: ProcessorMap,
    ) -> Result<()>
    where
        F: FnOnce(Arc<ServBase>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let args = ServerArgs::from(CmdArgs::parse());
        self.run(cfg, args, ServerModel::MasterSlave, init_fn, procs)
            .await
    }

    /// Full startup then block on signals. Never returns on success.
    pub async fn run<F, Fut>(
        &self,
        cfg: CoordConfig,
        args: ServerArgs,
        model: ServerModel,
        init_fn: F,
        procs: ProcessorMap,
    ) -> Result<()>
    where
        F: FnOnce(Arc<ServBase>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let sbase = match self.setup(cfg, args, model, init_fn, procs).await {
            Ok(sbase) => sbase,
            Err(e) => {
                error!(error = %e, "server startup failed");
                return Err(e);
            }
        };
        info!("server start success...");
        self.await_signals(sbase).await
    }

    /// Everything up to the signal wait, in the mandated order. Exposed for
    /// application test harnesses, which drive a started instance directly.
    pub async fn setup<F, Fut>(
        &self,
        cfg: CoordConfig,
        args: ServerArgs,
        model: ServerModel,
        init_fn: F,
        procs: ProcessorMap,
    ) -> Result<Arc<ServBase>>
    where
        F: FnOnce(Arc<ServBase>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        // Configuration errors abort before any store contact.
        validate_processor_names(&procs)?;

        let sbase = ServBase::new(
            &cfg,
            &args.serv_location,
            &args.session_key,
            &args.group,
            args.sid_offset,
        )
        .await?;
        *self.sbase.lock() = Some(sbase.clone());

        let mut telemetry =
            Telemetry::init_logging(&args.serv_location, &sbase.copy_name(), &args.log)?;

        // The backdoor answers liveness probes and must not emit spans, so
        // it comes up before the tracer.
        self.init_backdoor(&sbase).await;

        if model == ServerModel::MasterSlave {
            let lock = types::master_slave_lock(&args.serv_location);
            info!(lock = %lock, "waiting for leadership");
            sbase.lock_global(&lock).await?;
            info!(lock = %lock, "leadership acquired");
        }

        init_fn(sbase.clone()).await?;

        // Transports install tracing middleware at bind time; the global
        // tracer must exist first.
        telemetry.init_tracer()?;

        let infos = self.init_processors(&procs).await?;
        sbase.register_service(infos.clone()).await?;
        if let Err(e) = sbase.register_cross_dc(infos).await {
            warn!(error = %e, "cross-dc registration failed");
        }

        sbase.set_group_and_disable(&args.group, args.disable).await?;

        self.init_metrics(&sbase).await;

        // The SDK handle lives as long as the orchestrator.
        *self.telemetry.lock() = Some(telemetry);
        Ok(sbase)
    }

    /// Validate, initialize and bind every user processor, collecting the
    /// endpoint map to publish.
    async fn init_processors(&self, procs: &ProcessorMap) -> Result<BTreeMap<String, ServInfo>> {
        let mut infos = BTreeMap::new();
        for (name, processor) in procs {
            processor.init().await.map_err(|e| {
                Error::InvalidProcessor(format!("processor {name} init failed: {e}"))
            })?;
            let (addr, driver) = processor.driver();
            let bound = binder::bind(name, &addr, driver).await?;
            if let Some(engine) = bound.engine {
                self.engines.lock().insert(name.clone(), engine);
            }
            infos.insert(name.clone(), bound.info);
        }
        Ok(infos)
    }

    async fn init_backdoor(&self, sbase: &Arc<ServBase>) {
        let router = backdoor_router(sbase, self.started);
        match binder::bind(PROC_BACKDOOR, "127.0.0.1:0", Driver::Http(router)).await {
            Ok(bound) => {
                let mut infos = BTreeMap::new();
                infos.insert(PROC_BACKDOOR.to_string(), bound.info);
                if let Err(e) = sbase.register_backdoor(infos).await {
                    warn!(error = %e, "backdoor registration failed");
                }
            }
            Err(e) => warn!(error = %e, "backdoor bind failed"),
        }
    }

    async fn init_metrics(&self, sbase: &Arc<ServBase>) {
        let router = metrics_router(sbase, self.started);
        match binder::bind(PROC_METRICS, "127.0.0.1:0", Driver::Http(router)).await {
            Ok(bound) => {
                let mut infos = BTreeMap::new();
                infos.insert(PROC_METRICS.to_string(), bound.info);
                if let Err(e) = sbase.register_metrics(infos).await {
                    warn!(error = %e, "metrics registration failed");
                }
            }
            Err(e) => warn!(error = %e, "metrics bind failed"),
        }
    }

    /// Swap the dispatcher of an already-bound engine processor.
    pub fn reload_processor(&self, processor: &str, router: Router) -> Result<()> {
        match self.engines.lock().get(processor) {
            Some(engine) => {
                engine.reload(router);
                info!(processor, "processor rerouted");
                Ok(())
            }
            None => Err(Error::InvalidProcessor(format!(
                "processor {processor} has no reloadable driver"
            ))),
        }
    }

    pub fn serv_base(&self) -> Option<Arc<ServBase>> {
        self.sbase.lock().clone()
    }

    /// Block on OS signals. SIGTERM stops the publisher and parks so
    /// in-flight serve loops drain naturally; SIGINT/SIGQUIT are logged;
    /// SIGPIPE is swallowed.
    async fn await_signals(&self, sbase: Arc<ServBase>) -> Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate())?;
            let mut int = signal(SignalKind::interrupt())?;
            let mut quit = signal(SignalKind::quit())?;
            let mut pipe = signal(SignalKind::pipe())?;
            loop {
                tokio::select! {
                    _ = term.recv() => {
                        info!("received SIGTERM, stopping server");
                        sbase.stop().await;
                        // Park so in-flight serve loops drain; the
                        // operator's kill timeout finishes the exit.
                        futures::future::pending::<()>().await;
                    }
                    _ = int.recv() => info!("received SIGINT"),
                    _ = quit.recv() => info!("received SIGQUIT"),
                    _ = pipe.recv() => {}
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("received interrupt, stopping server");
            sbase.stop().await;
            futures::future::pending::<()>().await;
        }
        #[allow(unreachable_code)]
        Ok(())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_processor_names(procs: &ProcessorMap) -> Result<()> {
    for name in procs.keys() {
        if name.is_empty() {
            return Err(Error::InvalidProcessor("processor name empty".to_string()));
        }
        if name.starts_with('_') {
            return Err(Error::InvalidProcessor(
                "processor name can not prefix '_'".to_string(),
            ));
        }
    }
    Ok(())
}

fn backdoor_router(sbase: &Arc<ServBase>, started: Instant) -> Router {
    let copy = sbase.copy_name();
    let serv_id = sbase.serv_id();
    Router::new()
        .route("/", get(|| async { "rookery" }))
        .route("/health", get(|| async { "OK" }))
        .route(
            "/status",
            get(move || async move {
                format!(
                    "{{\"copy\":\"{}\",\"serv_id\":{},\"uptime_secs\":{}}}",
                    copy,
                    serv_id,
                    started.elapsed().as_secs()
                )
            }),
        )
}

fn metrics_router(sbase: &Arc<ServBase>, started: Instant) -> Router {
    let serv_id = sbase.serv_id();
    Router::new().route(
        "/metrics",
        get(move || async move {
            format!(
                "rookery_serv_id {}\nrookery_uptime_seconds {}\n",
                serv_id,
                started.elapsed().as_secs()
            )
        }),
    )
}

fn global_server() -> &'static Server {
    static SERVER: OnceLock<Server> = OnceLock::new();
    SERVER.get_or_init(Server::new)
}

/// Start the process-wide server from command-line flags.
pub async fn serve<F, Fut>(cfg: CoordConfig, init_fn: F, procs: ProcessorMap) -> Result<()>
where
    F: FnOnce(Arc<ServBase>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    global_server().serve(cfg, init_fn, procs).await
}

/// Start the process-wide server in leader/follower mode.
pub async fn master_slave<F, Fut>(cfg: CoordConfig, init_fn: F, procs: ProcessorMap) -> Result<()>
where
    F: FnOnce(Arc<ServBase>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    global_server().master_slave(cfg, init_fn, procs).await
}

/// Application-test entry: explicit arguments, no signal wait.
pub async fn init<F, Fut>(
    cfg: CoordConfig,
    serv_location: &str,
    session_key: &str,
    log_dir: &str,
    init_fn: F,
    procs: ProcessorMap,
) -> Result<Arc<ServBase>>
where
    F: FnOnce(Arc<ServBase>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let args = ServerArgs {
        serv_location: serv_location.to_string(),
        session_key: session_key.to_string(),
        log: LogOptions {
            dir: log_dir.to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    global_server()
        .setup(cfg, args, ServerModel::Server, init_fn, procs)
        .await
}

/// Local development entry: console logging, instance disabled, no
/// processors published.
pub async fn test<F, Fut>(cfg: CoordConfig, serv_location: &str, init_fn: F) -> Result<Arc<ServBase>>
where
    F: FnOnce(Arc<ServBase>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let args = ServerArgs {
        serv_location: serv_location.to_string(),
        session_key: "test".to_string(),
        log: LogOptions {
            dir: LOG_DIR_CONSOLE.to_string(),
            ..Default::default()
        },
        disable: true,
        ..Default::default()
    };
    global_server()
        .setup(cfg, args, ServerModel::Server, init_fn, ProcessorMap::new())
        .await
}

/// Swap the dispatcher of an engine processor on the process-wide server.
pub fn reload_processor(processor: &str, router: Router) -> Result<()> {
    global_server().reload_processor(processor, router)
}

pub fn get_serv_base() -> Option<Arc<ServBase>> {
    global_server().serv_base()
}

pub fn get_serv_name() -> String {
    get_serv_base()
        .map(|sb| sb.serv_location().to_string())
        .unwrap_or_default()
}

pub fn get_serv_id() -> i32 {
    get_serv_base().map(|sb| sb.serv_id()).unwrap_or_default()
}

/// Group and service name of the process-wide server.
pub fn get_group_and_service() -> (String, String) {
    get_serv_base()
        .map(|sb| (sb.serv_group().to_string(), sb.serv_name().to_string()))
        .unwrap_or_default()
}

/// Address of one of this service's processors, scanning every published
/// instance of the service.
pub async fn get_processor_address(processor: &str) -> Option<String> {
    let sbase = get_serv_base()?;
    let infos = match sbase.reg_infos().await {
        Ok(infos) => infos,
        Err(e) => {
            warn!(error = %e, "reg info scan failed");
            return None;
        }
    };
    for raw in infos {
        match serde_json::from_str::<crate::registry::RegData>(&raw) {
            Ok(reg) => {
                if let Some(info) = reg.servs.get(processor) {
                    return Some(info.addr.clone());
                }
            }
            Err(e) => warn!(error = %e, payload = %raw, "unparseable reg info"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn procs_with(name: &str) -> ProcessorMap {
        let mut procs = ProcessorMap::new();
        procs.insert(
            name.to_string(),
            Arc::new(crate::binder::HttpProcessor::new("127.0.0.1:0", Router::new()))
                as Arc<dyn Processor>,
        );
        procs
    }

    #[test]
    fn reserved_and_empty_names_rejected() {
        let err = validate_processor_names(&procs_with("_admin")).unwrap_err();
        assert!(err.to_string().contains("processor name can not prefix '_'"));

        let err = validate_processor_names(&procs_with("")).unwrap_err();
        assert!(err.to_string().contains("processor name empty"));

        assert!(validate_processor_names(&procs_with("api")).is_ok());
    }

    #[test]
    fn cmd_args_require_serv_and_skey() {
        assert!(CmdArgs::try_parse_from(["servd"]).is_err());
        assert!(CmdArgs::try_parse_from(["servd", "--serv", "g/s"]).is_err());
        let args =
            CmdArgs::try_parse_from(["servd", "--serv", "g/s", "--skey", "k", "--sidoffset", "3"])
                .unwrap();
        assert_eq!(args.serv, "g/s");
        assert_eq!(args.sidoffset, 3);
        assert!(!args.disable);
    }

    #[test]
    fn reload_unknown_processor_is_an_error() {
        let server = Server::new();
        let err = server.reload_processor("web", Router::new()).unwrap_err();
        assert!(err.to_string().contains("no reloadable driver"));
    }
}
