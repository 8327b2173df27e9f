pub mod ambient;
pub mod args;
pub mod chat;
pub mod commands;
pub mod console;
pub mod events;
pub mod notifier;
pub mod players;
pub mod poll;
pub mod rcon;
pub mod restart;
pub mod settings;
pub mod state;
pub mod tracker;
pub mod vpn;
pub mod web;

pub use event_loop;
pub use reqwest;
pub use tokio;
