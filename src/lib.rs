//! Collaborative code-editing rooms: the client session core (presence,
//! replicated document, event channel, save arbitration, reconnection) and
//! the room server it talks to.

pub mod app;
pub mod auth;
pub mod clients;
pub mod config;
pub mod docs;
pub mod document;
pub mod error;
pub mod handlers;
pub mod models;
pub mod presence;
pub mod routes;
pub mod services;
pub mod session;
pub mod utils;
pub mod ws;
