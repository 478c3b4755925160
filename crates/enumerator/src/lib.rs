mod config;
mod crawler;
mod enumeration;
mod error;
mod events;
mod filter;
mod flow;
mod graph;
mod model;
mod net;
mod service;
mod services;
mod sources;
pub mod utils;

pub use config::Config;
pub use enumeration::Enumeration;
pub use error::{Error, Result};
pub use graph::{DataOp, Graph, GraphState};
pub use model::{AddressInfo, Discovery, Request, Tag, Timing};
pub use sources::{Source, SourceService};
