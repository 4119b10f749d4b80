//! Application startup and lifecycle management.

use crate::config::FinanceConfig;
use crate::handlers::{self, orders, payments, students};
use crate::services::{Database, FinanceService};
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::Router;
use service_core::error::AppError;
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: FinanceConfig,
    pub db: Arc<Database>,
    pub finance: Arc<FinanceService>,
}

/// Builds the router for the given state.
pub fn router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.common.request_timeout_secs);

    let api = Router::new()
        .route("/create_finance_student", post(students::create_finance_student))
        .route("/get_finance_students", get(students::get_finance_students))
        .route("/get_paid_tuition_students", get(students::get_paid_tuition_students))
        .route("/get_student_orders", get(students::get_student_orders))
        .route("/create_order_with_structure", post(orders::create_order_with_structure))
        .route("/get_order_with_structure", get(orders::get_order_with_structure))
        .route("/update_order_structure", post(orders::update_order_structure))
        .route("/get_order_students_v2", get(orders::get_order_students_v2))
        .route("/add_students_to_order_v2", post(orders::add_students_to_order_v2))
        .route("/export_order_fee_template", get(orders::export_order_fee_template))
        .route("/import_student_fee_data", post(orders::import_student_fee_data))
        .route("/recalculate_order_totals", post(orders::recalculate_order_totals))
        .route("/get_unpaid_students", get(orders::get_unpaid_students))
        .route("/update_order_student_payment", post(payments::update_order_student_payment))
        .route("/record_milestone_payment", post(payments::record_milestone_payment))
        .route("/get_debit_note_preview", get(payments::get_debit_note_preview));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/finance", api)
        .layer(TimeoutLayer::new(timeout))
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Connects to the database, applies migrations and binds the listener.
    pub async fn build(config: FinanceConfig) -> Result<Self, AppError> {
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await?;
        db.run_migrations().await?;

        Self::build_with_database(config, db).await
    }

    /// Binds the listener over an existing pool (port 0 picks a free port).
    pub async fn build_with_database(config: FinanceConfig, db: Database) -> Result<Self, AppError> {
        let db = Arc::new(db);
        let finance = Arc::new(FinanceService::new(db.clone(), config.finance.clone()));

        let addr: SocketAddr = format!("{}:{}", config.common.host, config.common.port)
            .parse()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid listen address: {}", e)))?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port = port,
            formula_mode = config.finance.formula_mode.as_str(),
            payment_tolerance = %config.finance.payment_tolerance,
            "Finance service listening"
        );

        Ok(Self {
            port,
            listener,
            state: AppState {
                config,
                db,
                finance,
            },
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    pub async fn run_with_shutdown<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state);
        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    }
}
