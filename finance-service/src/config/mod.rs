//! Configuration module for finance-service.

use crate::engine::payment::DEFAULT_PAYMENT_TOLERANCE;
use crate::engine::FormulaMode;
use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

pub const DEFAULT_ADMIN_ROLES: &str = "System Manager,SIS Manager,Registrar,SIS BOD";

#[derive(Debug, Clone)]
pub struct FinanceConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub finance: FinanceSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Business knobs of the fee engine.
#[derive(Debug, Clone)]
pub struct FinanceSettings {
    /// Roles allowed to call any finance endpoint.
    pub admin_roles: Vec<String>,
    pub formula_mode: FormulaMode,
    pub payment_tolerance: Decimal,
}

impl Default for FinanceSettings {
    fn default() -> Self {
        Self {
            admin_roles: parse_roles(DEFAULT_ADMIN_ROLES),
            formula_mode: FormulaMode::Legacy,
            payment_tolerance: DEFAULT_PAYMENT_TOLERANCE,
        }
    }
}

pub fn parse_roles(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

impl FinanceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let formula_mode = match env::var("FINANCE_FORMULA_MODE") {
            Ok(raw) => raw
                .parse()
                .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
            Err(_) => FormulaMode::Legacy,
        };

        let payment_tolerance = match env::var("FINANCE_PAYMENT_TOLERANCE") {
            Ok(raw) => raw.trim().parse::<Decimal>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("FINANCE_PAYMENT_TOLERANCE: {}", e))
            })?,
            Err(_) => DEFAULT_PAYMENT_TOLERANCE,
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "finance-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            finance: FinanceSettings {
                admin_roles: parse_roles(
                    &env::var("FINANCE_ADMIN_ROLES").unwrap_or_else(|_| DEFAULT_ADMIN_ROLES.to_string()),
                ),
                formula_mode,
                payment_tolerance,
            },
        })
    }
}
