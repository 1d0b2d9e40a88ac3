// src/config.rs

use crate::connection::OUTBOUND_QUEUE_CAPACITY;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};

/// Real-time chat server
#[derive(Parser, Clone, Debug)]
#[command(name = "realtime-chat", version, about = "Real-time chat and presence server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "CHAT_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "CHAT_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// PostgreSQL URL; without it messages and presence stay in memory
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// HS256 secret shared with the account service
    #[arg(long, env = "JWT_SECRET", default_value = "default-secret-key", hide_env_values = true)]
    pub jwt_secret: String,

    /// Capacity of each connection's outbound queue
    #[arg(long, env = "CHAT_OUTBOUND_QUEUE", default_value_t = OUTBOUND_QUEUE_CAPACITY)]
    pub outbound_queue: usize,

    /// Emit structured JSON logs
    #[arg(long, env = "CHAT_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}
