//! A memcached binary protocol client on top of the `mcpipe` engine.
//!
//! Every operation comes in two flavors: a blocking one that drives the
//! engine until its reply arrives, and an `_async` one returning a
//! [`Pending`] future that resolves as the client is driven with
//! [`Client::run_once`] or [`Client::run_until_idle`].

#[macro_use]
extern crate quick_error;

mod client;
mod error;

pub use client::{Client, Item, Pending};
pub use error::{ClientError, Result};
