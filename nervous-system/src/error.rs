/**
 * ERREURS - Taxonomie des erreurs du nervous system
 *
 * TransportError : broker injoignable, flux fermé, requête refusée -> retry local.
 * ConfigError    : configuration invalide -> fatal au démarrage uniquement.
 * NervousError   : erreur de haut niveau remontée jusqu'au binaire.
 */

/// Défaillance du transport broker (jamais fatale en régime établi)
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("subscription rejected for {topics:?}: {reason}")]
    SubscribeRejected { topics: Vec<String>, reason: String },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("connection timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },
    #[error("config file {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("topic {topic} is claimed by both {first} and {second}")]
    OverlappingTopic {
        topic: String,
        first: String,
        second: String,
    },
    #[error("route {0} has no source topic")]
    NoSources(String),
    #[error("route {0} has no destination")]
    NoDestinations(String),
    #[error("duplicate agent id: {0}")]
    DuplicateAgent(String),
    #[error("invalid timing: {0}")]
    InvalidTiming(String),
    #[error("topic {topic} of {owner} contains an MQTT wildcard")]
    WildcardTopic { topic: String, owner: String },
}

#[derive(Debug, thiserror::Error)]
pub enum NervousError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("shutdown requested")]
    Cancelled,
}

pub type Result<T, E = NervousError> = std::result::Result<T, E>;
