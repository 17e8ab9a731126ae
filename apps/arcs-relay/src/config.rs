use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    pub idle_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub audit_log_path: String,
    pub device_store_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("ARCS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            jwt_secret: env::var("ARCS_JWT_SECRET")
                .unwrap_or_else(|_| "your-secret-key-change-me".to_string()),
            token_ttl_hours: env::var("ARCS_TOKEN_TTL_HOURS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(24),
            idle_timeout_secs: env::var("ARCS_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(300),
            cleanup_interval_secs: env::var("ARCS_CLEANUP_INTERVAL_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(60),
            audit_log_path: env::var("ARCS_AUDIT_LOG")
                .unwrap_or_else(|_| "arcs_audit.log".to_string()),
            device_store_path: env::var("ARCS_DEVICE_STORE").ok(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            jwt_secret: "your-secret-key-change-me".to_string(),
            token_ttl_hours: 24,
            idle_timeout_secs: 300,
            cleanup_interval_secs: 60,
            audit_log_path: "arcs_audit.log".to_string(),
            device_store_path: None,
        }
    }
}
