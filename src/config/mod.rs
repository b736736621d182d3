// Config module - typed notary configuration, validated once at startup

mod notary_config;

pub use notary_config::{AccountId, ConfigError, Network, NotaryConfig};
