// src/lib.rs - Control server library: firmware link, object model, code pipeline and IPC
pub mod abort;
pub mod code;
pub mod config;
pub mod files;
pub mod intercept;
pub mod ipc;
pub mod model;
pub mod pipeline;
pub mod server;
pub mod services;
pub mod transport;

pub use code::{Code, CodeChannel, CodeResult, CodeType};
pub use config::{Config, load_config};
pub use server::{ControlServer, ServerError};
pub use services::Services;
