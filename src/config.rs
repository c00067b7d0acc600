//! Service configuration sourced from environment variables.
//!
//! # Purpose
//! Every variable the service reads is declared in one registry with its
//! default and description, so `build-doc` can render the authoritative
//! environment documentation from the same source the runtime uses.
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// One documented environment variable.
pub struct EnvVariable {
    pub name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
}

impl EnvVariable {
    fn value(&self) -> String {
        std::env::var(self.name).unwrap_or_else(|_| self.default.to_string())
    }
}

pub const ENV_PORT: EnvVariable = EnvVariable {
    name: "ICC_PORT",
    default: "9007",
    description: "Port on which the service listens.",
};

pub const ENV_REDIS_HOST: EnvVariable = EnvVariable {
    name: "ICC_REDIS_HOST",
    default: "localhost",
    description: "Host of the redis instance that distributes icc messages. Falls back to CACHE_HOST.",
};

pub const ENV_REDIS_PORT: EnvVariable = EnvVariable {
    name: "ICC_REDIS_PORT",
    default: "6379",
    description: "Port of the redis instance that distributes icc messages. Falls back to CACHE_PORT.",
};

pub const ENV_METRICS_PORT: EnvVariable = EnvVariable {
    name: "ICC_METRICS_PORT",
    default: "8080",
    description: "Port on which prometheus metrics are served.",
};

pub const ENV_DATASTORE_PROTOCOL: EnvVariable = EnvVariable {
    name: "DATASTORE_READER_PROTOCOL",
    default: "http",
    description: "Protocol of the datastore reader.",
};

pub const ENV_DATASTORE_HOST: EnvVariable = EnvVariable {
    name: "DATASTORE_READER_HOST",
    default: "localhost",
    description: "Host of the datastore reader.",
};

pub const ENV_DATASTORE_PORT: EnvVariable = EnvVariable {
    name: "DATASTORE_READER_PORT",
    default: "9010",
    description: "Port of the datastore reader.",
};

pub const ENV_DEVELOPMENT: EnvVariable = EnvVariable {
    name: "OPENSLIDES_DEVELOPMENT",
    default: "false",
    description: "Enables debug logging and the development auth key.",
};

pub const ENV_AUTH_TOKEN_KEY_FILE: EnvVariable = EnvVariable {
    name: "AUTH_TOKEN_KEY_FILE",
    default: "/run/secrets/auth_token_key",
    description: "File that contains the key to verify auth tokens.",
};

const REGISTRY: &[&EnvVariable] = &[
    &ENV_PORT,
    &ENV_REDIS_HOST,
    &ENV_REDIS_PORT,
    &ENV_METRICS_PORT,
    &ENV_DATASTORE_PROTOCOL,
    &ENV_DATASTORE_HOST,
    &ENV_DATASTORE_PORT,
    &ENV_DEVELOPMENT,
    &ENV_AUTH_TOKEN_KEY_FILE,
];

/// Token key used when `OPENSLIDES_DEVELOPMENT` is truthy and no secret
/// file is available.
pub const DEV_TOKEN_KEY: &str = "auth-dev-token-key";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub metrics_port: u16,
    pub redis_addr: String,
    pub datastore_url: String,
    pub development: bool,
    pub auth_token_key_file: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = ENV_PORT
            .value()
            .parse()
            .with_context(|| format!("parse {}", ENV_PORT.name))?;
        let metrics_port = ENV_METRICS_PORT
            .value()
            .parse()
            .with_context(|| format!("parse {}", ENV_METRICS_PORT.name))?;

        // The shared cache variables are the cluster-wide way to point all
        // services at one redis; the ICC specific variables win when set.
        let redis_host = std::env::var(ENV_REDIS_HOST.name)
            .or_else(|_| std::env::var("CACHE_HOST"))
            .unwrap_or_else(|_| ENV_REDIS_HOST.default.to_string());
        let redis_port = std::env::var(ENV_REDIS_PORT.name)
            .or_else(|_| std::env::var("CACHE_PORT"))
            .unwrap_or_else(|_| ENV_REDIS_PORT.default.to_string());

        let datastore_url = format!(
            "{}://{}:{}",
            ENV_DATASTORE_PROTOCOL.value(),
            ENV_DATASTORE_HOST.value(),
            ENV_DATASTORE_PORT.value(),
        );

        Ok(Self {
            port,
            metrics_port,
            redis_addr: format!("{redis_host}:{redis_port}"),
            datastore_url,
            development: is_truthy(&ENV_DEVELOPMENT.value()),
            auth_token_key_file: ENV_AUTH_TOKEN_KEY_FILE.value(),
        })
    }

    /// The key used to verify auth tokens: the secret file in production,
    /// a fixed key in development when the file is missing.
    pub fn auth_token_key(&self) -> Result<String> {
        match secret(&self.auth_token_key_file) {
            Ok(key) => Ok(key),
            Err(_) if self.development => Ok(DEV_TOKEN_KEY.to_string()),
            Err(err) => Err(err),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on")
}

/// Reads a secret from a file, by convention under `/run/secrets/`.
pub fn secret(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("reading `{}`", path.display()))?;
    Ok(content.trim_end_matches('\n').to_string())
}

/// Renders the environment documentation as a markdown table.
pub fn build_doc() -> String {
    let mut doc = String::from(
        "<!-- Generated with `icc-service build-doc` -->\n\n\
         # Configuration\n\n\
         | Environment Variable | Default Value | Description |\n\
         |---|---|---|\n",
    );
    for variable in REGISTRY {
        doc.push_str(&format!(
            "| `{}` | `{}` | {} |\n",
            variable.name, variable.default, variable.description
        ));
    }
    doc
}
