//! Gateway configuration: schema, loading, validation and timing defaults.

pub mod defaults;
pub mod error;
pub mod loader;
pub mod schema;

pub use defaults::GatewayDefaults;
pub use error::{ConfigError, ValidationResult, ValidationWarning};
pub use loader::{find_config_file, load_and_validate, load_config, parse_config, validate};
pub use schema::{
    BackendConfig, BackendTransport, ClientIdentity, Config, FrontendConfig, HttpTransport, Limits,
    PrefixPolicy, StreamTransport, normalize_backend_name,
};
