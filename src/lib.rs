//! Streamchat
//!
//! Long-lived HTTP streaming chat server. Clients hold one streaming `GET`
//! open and publish with separate form `POST`s; every published message is
//! fanned out, in one global order, to every open stream as a
//! length-prefixed frame.

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
