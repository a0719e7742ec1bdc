//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let local_addr = std_listener.local_addr()?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %local_addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Render the registry in the Prometheus text format.
pub fn encode_registry(registry: &Registry) -> Result<String> {
    let families = registry.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metrics")
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    match encode_registry(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by a lifecycle controller instance.
#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    registry: SharedRegistry,
    transitions: IntCounterVec,
    reconciliations: IntCounterVec,
    tickers_live: IntGauge,
    stale_persists: IntCounter,
}

impl ControllerMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let transitions = IntCounterVec::new(
            Opts::new(
                "botdeck_transitions_total",
                "Lifecycle operations by operation and result tag",
            ),
            &["operation", "result"],
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "botdeck_reconciliations_total",
                "Reconciliation decisions by observation source",
            ),
            &["source", "decision"],
        )?;
        registry.register(Box::new(reconciliations.clone()))?;

        let tickers_live = IntGauge::with_opts(Opts::new(
            "botdeck_tickers_live",
            "Number of periodic tickers currently running",
        ))?;
        registry.register(Box::new(tickers_live.clone()))?;

        let stale_persists = IntCounter::with_opts(Opts::new(
            "botdeck_stale_persists_total",
            "Persistence completions that arrived after a newer transition",
        ))?;
        registry.register(Box::new(stale_persists.clone()))?;

        Ok(Self {
            registry,
            transitions,
            reconciliations,
            tickers_live,
            stale_persists,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_transition(&self, operation: &str, result: &str) {
        self.transitions
            .with_label_values(&[operation, result])
            .inc();
    }

    pub fn record_reconciliation(&self, source: &str, decision: &str) {
        self.reconciliations
            .with_label_values(&[source, decision])
            .inc();
    }

    pub fn set_tickers_live(&self, count: usize) {
        self.tickers_live.set(count as i64);
    }

    pub fn inc_stale_persist(&self) {
        self.stale_persists.inc();
    }
}

/// Metrics recorded by the control-plane HTTP server.
#[derive(Clone, Debug)]
pub struct ControlPlaneMetrics {
    registry: SharedRegistry,
    requests: IntCounterVec,
    push_subscribers: IntGauge,
}

impl ControlPlaneMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new(
                "botdeck_control_plane_requests_total",
                "Control plane requests by route and response status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let push_subscribers = IntGauge::with_opts(Opts::new(
            "botdeck_push_subscribers",
            "Open record push subscriptions",
        ))?;
        registry.register(Box::new(push_subscribers.clone()))?;

        Ok(Self {
            registry,
            requests,
            push_subscribers,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_request(&self, route: &str, status: u16) {
        self.requests
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    pub fn subscriber_opened(&self) {
        self.push_subscribers.inc();
    }

    pub fn subscriber_closed(&self) {
        self.push_subscribers.dec();
    }
}

pub use prometheus;
