//! Demo service hosting an HTTP API and a hot-reloadable engine processor.
//!
//! ```text
//! echoserv --serv demo/echo --skey devkey --logdir console
//! ```

use rookery::binder::{EngineProcessor, HttpProcessor};
use rookery::{CoordConfig, Processor, ProcessorMap};

use axum::extract::Path;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

async fn echo(Path(msg): Path<String>) -> String {
    msg
}

async fn whoami() -> String {
    let (group, service) = rookery::server::get_group_and_service();
    format!("{group}/{service}/{}", rookery::server::get_serv_id())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = CoordConfig::new(vec!["mem://echoserv".to_string()], "/rookery");

    let api = Router::new().route("/echo/:msg", get(echo));
    let web = Router::new().route("/whoami", get(whoami));

    let mut procs = ProcessorMap::new();
    procs.insert(
        "api".to_string(),
        Arc::new(HttpProcessor::new("127.0.0.1:0", api)) as Arc<dyn Processor>,
    );
    procs.insert(
        "web".to_string(),
        Arc::new(EngineProcessor::new("127.0.0.1:0", web)) as Arc<dyn Processor>,
    );

    rookery::server::serve(
        cfg,
        |sbase| async move {
            tracing::info!(serv_id = sbase.serv_id(), "echo service initializing");
            Ok(())
        },
        procs,
    )
    .await?;

    Ok(())
}
