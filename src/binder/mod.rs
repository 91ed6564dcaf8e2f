//! Endpoint binder
//!
//! Brings application-supplied processors online on transport-appropriate
//! listeners and reports the resolved `host:port`. Serve loops run on
//! detached tasks; the binder never interprets a driver's internal routing.
//!
//! `Engine` drivers are bound behind an atomically swappable dispatcher so
//! the server can reroute an already-listening processor without closing
//! its listener.

use crate::registry::{ProcessorKind, ServInfo};
use crate::{Error, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tonic::service::Routes;
use tonic::transport::server::TcpIncoming;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

/// Handler for one accepted connection of a framed-TCP (thrift-style)
/// processor. The binder owns the listener and accept loop; the handler owns
/// everything after accept.
#[async_trait]
pub trait ThriftHandler: Send + Sync {
    async fn serve_conn(&self, stream: TcpStream, peer: SocketAddr) -> Result<()>;
}

/// Transport driver of one processor. Adding a protocol means adding a
/// variant here and a bind arm below.
pub enum Driver {
    /// Plain HTTP router.
    Http(Router),
    /// Middleware-engine HTTP router with hot-reroute support.
    Engine(Router),
    /// gRPC service routes.
    Grpc(Routes),
    /// Framed-TCP processor.
    Thrift(Arc<dyn ThriftHandler>),
}

impl Driver {
    pub fn kind(&self) -> ProcessorKind {
        match self {
            Driver::Http(_) => ProcessorKind::Http,
            Driver::Engine(_) => ProcessorKind::Gin,
            Driver::Grpc(_) => ProcessorKind::Grpc,
            Driver::Thrift(_) => ProcessorKind::Thrift,
        }
    }
}

/// An application-supplied request processor plus its transport kind.
#[async_trait]
pub trait Processor: Send + Sync {
    /// One-time initialization before binding.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Desired listen address (empty or `:0` for OS-assigned) and the
    /// transport driver to serve.
    fn driver(&self) -> (String, Driver);
}

/// Swap point installed into a running engine serve loop. Storing a new
/// router reroutes subsequent requests without touching the listener.
#[derive(Clone)]
pub struct EngineHandle {
    slot: Arc<ArcSwap<Router>>,
}

impl EngineHandle {
    pub fn reload(&self, router: Router) {
        self.slot.store(Arc::new(router));
    }
}

/// Outcome of binding one processor.
pub struct BoundEndpoint {
    pub info: ServInfo,
    /// Present for `Engine` drivers only.
    pub engine: Option<EngineHandle>,
}

/// Bind a driver on the desired address and start its serve loop.
pub async fn bind(name: &str, addr: &str, driver: Driver) -> Result<BoundEndpoint> {
    let kind = driver.kind();
    let listener = listen(addr).await?;
    let bound = listener
        .local_addr()
        .map_err(|e| Error::Bind(format!("processor {name}: no local addr: {e}")))?;
    info!(processor = name, %kind, addr = %bound, "processor bound");

    let engine = match driver {
        Driver::Http(router) => {
            serve_http(name.to_string(), listener, router);
            None
        }
        Driver::Engine(router) => Some(serve_engine(name.to_string(), listener, router)),
        Driver::Grpc(routes) => {
            serve_grpc(name.to_string(), listener, routes)?;
            None
        }
        Driver::Thrift(handler) => {
            serve_thrift(name.to_string(), listener, handler);
            None
        }
    };

    Ok(BoundEndpoint {
        info: ServInfo::new(kind, bound.to_string()),
        engine,
    })
}

async fn listen(addr: &str) -> Result<TcpListener> {
    let addr = normalize_addr(addr);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Bind(format!("listen on {addr}: {e}")))
}

fn normalize_addr(addr: &str) -> String {
    if addr.is_empty() {
        "0.0.0.0:0".to_string()
    } else if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn serve_http(name: String, listener: TcpListener, router: Router) {
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(processor = %name, error = %e, "http serve loop exited");
        }
    });
}

fn serve_engine(name: String, listener: TcpListener, router: Router) -> EngineHandle {
    let slot = Arc::new(ArcSwap::from_pointee(router));
    let handle = EngineHandle { slot: slot.clone() };

    // Every request reads the current dispatcher from the swap point, so a
    // reload takes effect on the next request.
    let outer = Router::new().fallback_service(tower::service_fn(move |req: Request<Body>| {
        let slot = slot.clone();
        async move {
            let router = Router::clone(&slot.load_full());
            router.oneshot(req).await
        }
    }));

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, outer).await {
            error!(processor = %name, error = %e, "engine serve loop exited");
        }
    });
    handle
}

fn serve_grpc(name: String, listener: TcpListener, routes: Routes) -> Result<()> {
    let incoming = TcpIncoming::from_listener(listener, true, None)
        .map_err(|e| Error::Bind(format!("processor {name}: grpc incoming: {e}")))?;
    tokio::spawn(async move {
        let server = tonic::transport::Server::builder().add_routes(routes);
        if let Err(e) = server.serve_with_incoming(incoming).await {
            error!(processor = %name, error = %e, "grpc serve loop exited");
        }
    });
    Ok(())
}

fn serve_thrift(name: String, listener: TcpListener, handler: Arc<dyn ThriftHandler>) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    let name = name.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.serve_conn(stream, peer).await {
                            debug!(processor = %name, %peer, error = %e, "connection closed");
                        }
                    });
                }
                Err(e) => {
                    warn!(processor = %name, error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    });
}

/// Ready-made HTTP processor serving an [`axum::Router`].
pub struct HttpProcessor {
    addr: String,
    router: Router,
}

impl HttpProcessor {
    pub fn new(addr: impl Into<String>, router: Router) -> Self {
        Self {
            addr: addr.into(),
            router,
        }
    }
}

#[async_trait]
impl Processor for HttpProcessor {
    fn driver(&self) -> (String, Driver) {
        (self.addr.clone(), Driver::Http(self.router.clone()))
    }
}

/// Ready-made middleware-engine processor; its router may be hot-swapped
/// through the server after binding.
pub struct EngineProcessor {
    addr: String,
    router: Router,
}

impl EngineProcessor {
    pub fn new(addr: impl Into<String>, router: Router) -> Self {
        Self {
            addr: addr.into(),
            router,
        }
    }
}

#[async_trait]
impl Processor for EngineProcessor {
    fn driver(&self) -> (String, Driver) {
        (self.addr.clone(), Driver::Engine(self.router.clone()))
    }
}

/// Ready-made gRPC processor serving tonic [`Routes`].
pub struct GrpcProcessor {
    addr: String,
    routes: Routes,
}

impl GrpcProcessor {
    pub fn new(addr: impl Into<String>, routes: Routes) -> Self {
        Self {
            addr: addr.into(),
            routes,
        }
    }
}

#[async_trait]
impl Processor for GrpcProcessor {
    fn driver(&self) -> (String, Driver) {
        (self.addr.clone(), Driver::Grpc(self.routes.clone()))
    }
}

/// Ready-made framed-TCP processor.
pub struct ThriftProcessor {
    addr: String,
    handler: Arc<dyn ThriftHandler>,
}

impl ThriftProcessor {
    pub fn new(addr: impl Into<String>, handler: Arc<dyn ThriftHandler>) -> Self {
        Self {
            addr: addr.into(),
            handler,
        }
    }
}

#[async_trait]
impl Processor for ThriftProcessor {
    fn driver(&self) -> (String, Driver) {
        (self.addr.clone(), Driver::Thrift(self.handler.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn http_get(addr: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut buf = String::new();
        stream.read_to_string(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn binds_http_on_ephemeral_port() {
        let router = Router::new().route("/ping", get(|| async { "pong" }));
        let bound = bind("api", "127.0.0.1:0", Driver::Http(router))
            .await
            .unwrap();
        assert_eq!(bound.info.kind, ProcessorKind::Http);
        assert!(bound.info.addr.starts_with("127.0.0.1:"));
        assert!(bound.engine.is_none());

        let resp = http_get(&bound.info.addr, "/ping").await;
        assert!(resp.contains("200 OK"), "{resp}");
        assert!(resp.ends_with("pong"), "{resp}");
    }

    #[tokio::test]
    async fn engine_reload_swaps_dispatcher_without_rebinding() {
        let router = Router::new().route("/who", get(|| async { "old" }));
        let bound = bind("web", "127.0.0.1:0", Driver::Engine(router))
            .await
            .unwrap();
        assert_eq!(bound.info.kind, ProcessorKind::Gin);
        let engine = bound.engine.expect("engine driver keeps a swap point");

        let resp = http_get(&bound.info.addr, "/who").await;
        assert!(resp.ends_with("old"), "{resp}");

        engine.reload(Router::new().route("/who", get(|| async { "new" })));
        let resp = http_get(&bound.info.addr, "/who").await;
        assert!(resp.ends_with("new"), "{resp}");
    }

    #[tokio::test]
    async fn thrift_handler_sees_connections() {
        struct Echo;
        #[async_trait]
        impl ThriftHandler for Echo {
            async fn serve_conn(&self, mut stream: TcpStream, _peer: SocketAddr) -> Result<()> {
                let mut buf = [0u8; 16];
                let n = stream.read(&mut buf).await?;
                stream.write_all(&buf[..n]).await?;
                Ok(())
            }
        }

        let bound = bind("raw", "127.0.0.1:0", Driver::Thrift(Arc::new(Echo)))
            .await
            .unwrap();
        assert_eq!(bound.info.kind, ProcessorKind::Thrift);

        let mut stream = TcpStream::connect(&bound.info.addr).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = vec![0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn listen_failure_is_fatal_to_binding() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let err = bind("api", &addr, Driver::Http(Router::new())).await;
        assert!(matches!(err, Err(Error::Bind(_))));
    }

    #[test]
    fn normalizes_empty_and_port_only_addresses() {
        assert_eq!(normalize_addr(""), "0.0.0.0:0");
        assert_eq!(normalize_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_addr("127.0.0.1:1"), "127.0.0.1:1");
    }
}
