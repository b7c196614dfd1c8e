//! Demo entry point. Wires the reference `InMemoryStore` + `MockBackend`
//! behind the execution core and exposes only the ambient surface this
//! crate owns: health and `/metrics`. The full HTTP/gRPC API a real
//! deployment would front this with is out of scope here — it belongs to
//! the gateway layer this core is consumed by.

use nebula_exec_core::asyncworker::{AsyncWorkerPool, AsyncWorkerConfig};
use nebula_exec_core::config::ExecutionCoreConfig;
use nebula_exec_core::executor::Executor;
use nebula_exec_core::logsink::{LogSink, NoopSinkBackend};
use nebula_exec_core::metrics::Metrics;
use nebula_exec_core::mock_backend::MockBackend;
use nebula_exec_core::notifier::ChannelNotifier;
use nebula_exec_core::pool::Pool;
use nebula_exec_core::scheduler::{Scheduler, SchedulerConfig};
use nebula_exec_core::store::InMemoryStore;
use nebula_exec_core::workflow::{WorkflowEngine, WorkflowEngineConfig};
use opentelemetry::global;
use opentelemetry_sdk::metrics::MeterProviderBuilder;
use poem::endpoint::PrometheusExporter;
use poem::get;
use poem::handler;
use poem::listener::TcpListener;
use poem::web::Json;
use poem::{EndpointExt, Route, Server};
use prometheus::Registry;
use std::sync::Arc;
use tokio::select;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[handler]
fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

fn init_tracing(config: &nebula_exec_core::config::TracingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn main() -> Result<(), std::io::Error> {
    if let Some(config) = ExecutionCoreConfig::load_or_dump_config() {
        init_tracing(&config.tracing);

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(async_main(config))
    } else {
        Ok(())
    }
}

async fn async_main(config: ExecutionCoreConfig) -> Result<(), std::io::Error> {
    info!(http_port = config.http_port, environment = %config.environment, "starting nebula execution core");

    let prometheus_registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(prometheus_registry.clone())
        .build()
        .expect("prometheus exporter must build");
    global::set_meter_provider(MeterProviderBuilder::default().with_reader(exporter).build());
    let metrics = Arc::new(Metrics::new(&prometheus_registry));

    let store: Arc<dyn nebula_exec_core::store::Store> = Arc::new(InMemoryStore::new());
    let backend = Arc::new(MockBackend::new());
    let notifier = Arc::new(ChannelNotifier::new());

    let pool = Pool::new_with_metrics(
        store.clone(),
        backend,
        notifier.clone(),
        config.pool.clone().into(),
        metrics.clone(),
    );

    let log_sink = Arc::new(LogSink::new(Arc::new(NoopSinkBackend), config.log_sink.clone().into()));
    let executor = Arc::new(Executor::new_with_metrics(pool.clone(), log_sink, metrics.clone()));

    let async_worker_pool = AsyncWorkerPool::new(
        store.clone(),
        executor.clone(),
        notifier.clone(),
        AsyncWorkerConfig::from(config.async_worker.clone()),
    );

    let workflow_engine = WorkflowEngine::new(
        store.clone(),
        executor,
        notifier,
        WorkflowEngineConfig::from(config.workflow_engine.clone()),
    );

    let _scheduler: Arc<Scheduler> = Scheduler::new(
        async_worker_pool,
        workflow_engine,
        SchedulerConfig::from(config.scheduler.clone()),
    );

    let http_port = config.http_port;
    let app = Route::new()
        .at("/healthz", get(healthz))
        .nest("/metrics", PrometheusExporter::new(prometheus_registry));

    let http_server = tokio::spawn(async move {
        Server::new(TcpListener::bind(format!("0.0.0.0:{}", http_port)))
            .run(app)
            .await
            .expect("HTTP server failed");
    });

    select! {
        _ = http_server => {},
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    pool.shutdown();
    Ok(())
}
