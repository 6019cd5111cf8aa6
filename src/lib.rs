use std::{future::Future, pin::Pin};

pub mod config;
pub mod context;
pub mod identity;
pub mod join;
pub mod member;
pub mod snapshot;
pub mod snapstore;
pub mod version;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
