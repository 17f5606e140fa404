pub mod api;
pub mod config;
pub mod envfile;
pub mod errors;
pub mod exec;
pub mod oauth;
pub mod onboarding;
pub mod pairing;
pub mod proxy;
pub mod server;
pub mod supervisor;
