//! Linux host for the skiff session engine: relay server, TCP transport,
//! disk storage and the terminal front end.

pub mod config;
pub mod files;
pub mod host;
pub mod logging;
pub mod relay;
pub mod signal_client;
pub mod storage;
pub mod transport;
pub mod ui;
