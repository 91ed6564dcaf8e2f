//! Integration tests for the registration lifecycle
//!
//! Slot allocation, payload shape, idempotency, and reserved-name
//! validation, all against the in-process coordination store.

use rookery::binder::HttpProcessor;
use rookery::coord::CoordStore;
use rookery::server::{Server, ServerArgs, ServerModel};
use rookery::telemetry::LogOptions;
use rookery::{
    CoordConfig, Processor, ProcessorKind, ProcessorMap, RegData, ServBase, ServInfo,
};

use axum::routing::get;
use axum::Router;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn test_config(name: &str) -> CoordConfig {
    CoordConfig::new(vec![format!("mem://{name}")], "/roots")
        .with_lease_ttl(Duration::from_millis(500))
        .with_heartbeat(Duration::from_millis(50))
}

fn console_args(serv: &str) -> ServerArgs {
    ServerArgs {
        serv_location: serv.to_string(),
        session_key: "k".to_string(),
        log: LogOptions {
            dir: "console".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn http_procs(name: &str) -> ProcessorMap {
    let router = Router::new().route("/ping", get(|| async { "pong" }));
    let mut procs = ProcessorMap::new();
    procs.insert(
        name.to_string(),
        Arc::new(HttpProcessor::new("127.0.0.1:0", router)) as Arc<dyn Processor>,
    );
    procs
}

#[tokio::test]
async fn single_instance_round_trip_publishes_exact_payload() {
    let cfg = test_config("reg-round-trip");
    let server = Server::new();
    let sbase = server
        .setup(
            cfg.clone(),
            console_args("groupA/svcX"),
            ServerModel::Server,
            |_| async { Ok(()) },
            http_procs("api"),
        )
        .await
        .unwrap();
    assert_eq!(sbase.serv_id(), 0);

    let store = cfg.connect().unwrap();
    let key = "/roots/dist/v2/groupA/svcX/0/reg";
    let snap = store.get_prefix(key).await.unwrap();
    let raw = snap.value_of(key).expect("reg must be published");

    let reg: RegData = serde_json::from_str(raw).unwrap();
    let api = &reg.servs["api"];
    assert_eq!(api.kind, ProcessorKind::Http);
    assert!(api.addr.starts_with("127.0.0.1:"));
    // Exact canonical shape: a plain servs mapping, nothing else.
    assert_eq!(
        raw,
        format!(
            r#"{{"servs":{{"api":{{"type":"http","addr":"{}"}}}}}}"#,
            api.addr
        )
    );
}

#[tokio::test]
async fn reserved_processor_name_fails_before_store_contact() {
    let cfg = test_config("reg-reserved-name");
    let server = Server::new();
    let err = server
        .setup(
            cfg.clone(),
            console_args("groupA/svcX"),
            ServerModel::Server,
            |_| async { Ok(()) },
            http_procs("_admin"),
        )
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("processor name can not prefix '_'"),
        "unexpected error: {err}"
    );

    let snap = cfg
        .connect()
        .unwrap()
        .get_prefix("/roots")
        .await
        .unwrap();
    assert!(snap.entries.is_empty(), "no CS keys may be written");
}

#[tokio::test]
async fn repeated_registration_is_byte_identical() {
    let cfg = test_config("reg-idempotent");
    let sbase = ServBase::new(&cfg, "groupA/svcX", "k", "", 0).await.unwrap();

    let mut servs = BTreeMap::new();
    servs.insert(
        "api".to_string(),
        ServInfo::new(ProcessorKind::Http, "127.0.0.1:40001"),
    );
    sbase.register_service(servs.clone()).await.unwrap();

    let store = cfg.connect().unwrap();
    let key = "/roots/dist/v2/groupA/svcX/0/reg";
    let first = store
        .get_prefix(key)
        .await
        .unwrap()
        .value_of(key)
        .unwrap()
        .to_string();

    sbase.register_service(servs).await.unwrap();
    let second = store
        .get_prefix(key)
        .await
        .unwrap()
        .value_of(key)
        .unwrap()
        .to_string();
    assert_eq!(first, second);
}

#[tokio::test]
async fn concurrent_starts_get_distinct_slots() {
    let cfg = test_config("reg-concurrent-slots");
    let mut handles = Vec::new();
    for i in 0..4 {
        let cfg = cfg.clone();
        handles.push(tokio::spawn(async move {
            let sbase = ServBase::new(&cfg, "groupA/svcZ", &format!("k{i}"), "", 0)
                .await
                .unwrap();
            sbase.serv_id()
        }));
    }
    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap());
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn sid_offset_shifts_allocation() {
    let cfg = test_config("reg-sid-offset");
    let sbase = ServBase::new(&cfg, "groupA/svcO", "k", "", 10).await.unwrap();
    assert_eq!(sbase.serv_id(), 10);

    let second = ServBase::new(&cfg, "groupA/svcO", "k", "", 0).await.unwrap();
    assert_eq!(second.serv_id(), 0, "offset-free instance takes the low slot");
}

#[tokio::test]
async fn group_and_disable_rewrite_reg_only() {
    let cfg = test_config("reg-group-disable");
    let sbase = ServBase::new(&cfg, "groupA/svcG", "k", "", 0).await.unwrap();

    let mut servs = BTreeMap::new();
    servs.insert(
        "api".to_string(),
        ServInfo::new(ProcessorKind::Http, "127.0.0.1:1"),
    );
    sbase.register_service(servs).await.unwrap();
    sbase.set_group_and_disable("canary", true).await.unwrap();

    let store = cfg.connect().unwrap();
    let dir = "/roots/dist/v2/groupA/svcG/0";
    let snap = store.get_prefix(dir).await.unwrap();
    let reg: RegData =
        serde_json::from_str(snap.value_of(&format!("{dir}/reg")).unwrap()).unwrap();
    let ctrl = reg.ctrl.expect("rewrite embeds the instance metadata");
    assert!(ctrl.disable);
    assert_eq!(ctrl.group, "canary");
    assert!(
        snap.value_of(&format!("{dir}/manual")).is_none(),
        "manual is operator-owned and never written by the instance"
    );
}

#[tokio::test]
async fn stop_deletes_reg_within_a_heartbeat() {
    let cfg = test_config("reg-stop");
    let sbase = ServBase::new(&cfg, "groupA/svcS", "k", "", 0).await.unwrap();
    let mut servs = BTreeMap::new();
    servs.insert(
        "api".to_string(),
        ServInfo::new(ProcessorKind::Http, "127.0.0.1:1"),
    );
    sbase.register_service(servs).await.unwrap();

    sbase.stop().await;
    tokio::time::sleep(cfg.heartbeat * 2).await;

    let snap = cfg
        .connect()
        .unwrap()
        .get_prefix("/roots/dist/v2/groupA/svcS")
        .await
        .unwrap();
    assert!(snap.entries.is_empty(), "stop must release the slot");
}

#[tokio::test]
async fn reg_infos_lists_every_instance() {
    let cfg = test_config("reg-infos");
    let a = ServBase::new(&cfg, "groupA/svcI", "k", "", 0).await.unwrap();
    let b = ServBase::new(&cfg, "groupA/svcI", "k", "", 0).await.unwrap();

    for (sbase, port) in [(&a, 1), (&b, 2)] {
        let mut servs = BTreeMap::new();
        servs.insert(
            "api".to_string(),
            ServInfo::new(ProcessorKind::Http, format!("127.0.0.1:{port}")),
        );
        sbase.register_service(servs).await.unwrap();
    }

    let infos = a.reg_infos().await.unwrap();
    assert_eq!(infos.len(), 2);
    for raw in infos {
        let reg: RegData = serde_json::from_str(&raw).unwrap();
        assert!(reg.servs.contains_key("api"));
    }
}

#[tokio::test]
async fn engine_processors_are_reloadable_through_the_server() {
    use rookery::binder::EngineProcessor;

    let cfg = test_config("reg-engine-reload");
    let server = Server::new();
    let mut procs = http_procs("api");
    procs.insert(
        "web".to_string(),
        Arc::new(EngineProcessor::new(
            "127.0.0.1:0",
            Router::new().route("/who", get(|| async { "old" })),
        )) as Arc<dyn Processor>,
    );
    server
        .setup(
            cfg,
            console_args("groupA/svcR"),
            ServerModel::Server,
            |_| async { Ok(()) },
            procs,
        )
        .await
        .unwrap();

    server
        .reload_processor("web", Router::new().route("/who", get(|| async { "new" })))
        .expect("engine driver keeps a swap point");
    let err = server.reload_processor("api", Router::new()).unwrap_err();
    assert!(err.to_string().contains("no reloadable driver"));
}

#[tokio::test]
async fn malformed_service_location_is_a_config_error() {
    let cfg = test_config("reg-bad-loc");
    let err = ServBase::new(&cfg, "justaname", "k", "", 0).await.unwrap_err();
    assert!(matches!(err, rookery::Error::Config(_)));
}

#[tokio::test]
async fn serv_config_reads_the_etc_subtree() {
    #[derive(Debug, Default, serde::Deserialize, PartialEq)]
    struct LogConf {
        #[serde(default)]
        level: String,
    }

    let cfg = test_config("reg-serv-config");
    let sbase = ServBase::new(&cfg, "groupA/svcC", "k", "", 0).await.unwrap();

    let absent: LogConf = sbase.serv_config().await.unwrap();
    assert_eq!(absent, LogConf::default());

    cfg.connect()
        .unwrap()
        .put(
            "/roots/etc/groupA/svcC/config",
            r#"{"level":"debug"}"#,
            None,
        )
        .await
        .unwrap();
    let conf: LogConf = sbase.serv_config().await.unwrap();
    assert_eq!(conf.level, "debug");
}

#[tokio::test]
async fn global_facades_reflect_the_started_instance() {
    let cfg = test_config("reg-global-facade");
    let sbase = rookery::server::init(
        cfg,
        "groupA/svcF",
        "k",
        "console",
        |_| async { Ok(()) },
        http_procs("api"),
    )
    .await
    .unwrap();

    assert_eq!(rookery::server::get_serv_name(), "groupA/svcF");
    assert_eq!(rookery::server::get_serv_id(), sbase.serv_id());
    assert_eq!(
        rookery::server::get_group_and_service(),
        ("groupA".to_string(), "svcF".to_string())
    );

    let addr = rookery::server::get_processor_address("api")
        .await
        .expect("api processor is published");
    assert!(addr.starts_with("127.0.0.1:"));
    assert!(rookery::server::get_processor_address("nosuch").await.is_none());
}
