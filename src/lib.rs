#[macro_use] extern crate rocket;
#[macro_use] extern crate serde_derive;

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod common;
pub mod config;
pub mod cors;
pub mod error;
pub mod rest_api;
pub mod service;
pub mod store;
pub mod viewer;
