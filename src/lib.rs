//! Headless chat client for the dating backend: REST history, an owned
//! WebSocket connection and the conversation sync layer between them.

pub mod common;
pub mod config;
pub mod error;
pub mod network;
pub mod storage;
pub mod sync;
