#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod config;
mod error;
pub mod event;
pub mod graph;
pub mod io;
pub mod render;
#[cfg(feature = "live")]
pub mod server;
mod site;
pub mod styles;
pub mod utils;
#[cfg(feature = "live")]
pub mod watch;

pub use crate::config::Config;
pub use crate::error::*;
pub use crate::graph::{Step, TaskGraph};
pub use crate::render::{CommandInterpreter, Interpreter, RenderResult, Renderer};
pub use crate::site::{Applied, Site};
