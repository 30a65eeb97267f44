// ABOUTME: Core library for berth - spawn-server supervision and worker sessions
// ABOUTME: Shared by the berth CLI and any front-end that embeds the supervisor

mod cancel;
pub mod channel;
pub mod config;
pub mod error;
pub mod headers;
pub mod options;
pub mod supervisor;
pub mod worker;

pub use channel::MessageChannel;
pub use config::{Config, ConfigError, SessionConfig, SpawnServerConfig};
pub use error::{ChannelError, SessionError, SpawnError};
pub use headers::{parse_header_block, HeaderBlock, HeaderError};
pub use options::SpawnOptions;
pub use supervisor::{
    ExecLauncher, ForkedHelper, HelperLauncher, HelperPhase, HelperProcess, SpawnSupervisor,
};
pub use worker::{
    parse_tcp_address, ListenAddress, ListenKind, SpawnedWorker, WorkerSession, WorkerStream,
};
