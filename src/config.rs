use std::{env, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} should be set")]
    Missing(&'static str),

    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub api_base: String,
    pub secret_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub frontend_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    pub upload_dir: PathBuf,
    pub amqp: AmqpConfig,
    pub payments: PaymentConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };
        let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = required("JWT_SECRET")?;
        if jwt_secret.len() < 16 {
            return Err(ConfigError::Invalid { key: "JWT_SECRET", value: "<shorter than 16 bytes>".into() });
        }

        let token_ttl_raw = or_default("TOKEN_TTL_HOURS", "168");
        let token_ttl_hours = match token_ttl_raw.parse::<i64>() {
            Ok(h) if h > 0 => h,
            _ => return Err(ConfigError::Invalid { key: "TOKEN_TTL_HOURS", value: token_ttl_raw }),
        };

        let port_raw = or_default("AMQP_PORT", "5672");
        let port = port_raw
            .parse::<u16>()
            .map_err(|_| ConfigError::Invalid { key: "AMQP_PORT", value: port_raw.clone() })?;

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_addr: or_default("BIND_ADDR", "127.0.0.1:8080"),
            jwt_secret,
            token_ttl_hours,
            upload_dir: PathBuf::from(or_default("UPLOAD_DIR", "uploads")),
            amqp: AmqpConfig {
                host: or_default("AMQP_HOST", "localhost"),
                port,
                user: or_default("AMQP_USER", "guest"),
                password: or_default("AMQP_PASSWORD", "guest"),
            },
            payments: PaymentConfig {
                api_base: or_default("PAYMENT_API_BASE", "https://api.stripe.com"),
                secret_key: lookup("PAYMENT_SECRET_KEY").filter(|v| !v.is_empty()),
                webhook_secret: lookup("PAYMENT_WEBHOOK_SECRET").filter(|v| !v.is_empty()),
                frontend_url: or_default("FRONTEND_URL", "http://localhost:3000"),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_required_keys_are_set() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/membership"),
            ("JWT_SECRET", "0123456789abcdef0123"),
        ]))
        .unwrap();

        assert_eq!(cfg.bind_addr, "127.0.0.1:8080");
        assert_eq!(cfg.token_ttl_hours, 168);
        assert_eq!(cfg.upload_dir, PathBuf::from("uploads"));
        assert_eq!(cfg.amqp.port, 5672);
        assert!(cfg.payments.secret_key.is_none());
    }

    #[test]
    fn missing_database_url_is_reported() {
        let err = Config::from_lookup(lookup_from(&[("JWT_SECRET", "0123456789abcdef0123")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn short_secret_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/membership"),
            ("JWT_SECRET", "short"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "JWT_SECRET", .. }));
    }

    #[test]
    fn bad_port_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/membership"),
            ("JWT_SECRET", "0123456789abcdef0123"),
            ("AMQP_PORT", "not-a-port"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "AMQP_PORT", .. }));
    }
}
