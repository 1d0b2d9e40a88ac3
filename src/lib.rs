// src/lib.rs

//! Real-time messaging for the shop backend: a per-room connection hub that
//! fans messages out to live websockets, the read/write pumps that drive each
//! socket, and a heartbeat-based presence tracker.

pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod hub;
pub mod identity;
pub mod models;
pub mod presence;
pub mod routes;
pub mod state;
pub mod websocket;
