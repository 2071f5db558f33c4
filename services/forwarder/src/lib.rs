pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::ForwardError;
pub use proxy::{
    Backend, Backends, Classification, ClassifierConfig, Listener, ListenerConfig, PrefixPolicy,
    RelayConfig, Route,
};
