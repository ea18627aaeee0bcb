pub mod account;
pub mod chain;
pub mod cli;
pub mod config;
pub mod content;
pub mod error;
pub mod monitor;
pub mod node;
pub mod operation;
pub mod reconciler;
pub mod rpc;
pub mod service;
pub mod submission;
