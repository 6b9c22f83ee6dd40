//! The Rust SDK for Flagsense, a feature flagging and experimentation platform.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that evaluates feature flags for [`User`]s, where each
//! user has a unique id and key-value [`Attributes`] associated with it. Evaluating a flag results
//! in a [`Variation`] (a variant key and its value) served to the user.
//!
//! Targeting rules are fetched from the server in the background and evaluated locally, so
//! [`Client::get_variation`] never touches the network. Evaluation counts and experiment events
//! are aggregated in memory and sent to the server periodically.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Flag evaluation never fails: if a flag cannot be evaluated, the default variation given in
//! [`FlagRef`] is served and the failure is reported to the server along with other events.
//! Errors are only returned when creating a client, waiting for initialization and shutting
//! down.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages. All records use the `flagsense` target. Consider integrating a `log`-compatible
//! logger implementation for better visibility into SDK operations.
//!
//! # Examples
//!
//! ```no_run
//! use flagsense::{ClientConfig, FlagRef, User};
//!
//! let client = ClientConfig::new("sdk-id", "sdk-secret")
//!     .environment("PROD")
//!     .to_client()?;
//! client.wait_for_initialization()?;
//!
//! let user = User::new("user-42").with_attribute("country", "IN");
//! let variation = client.get_variation(&FlagRef::new("new-checkout", "off", false), &user);
//! if variation.value == true {
//!     // ...
//!     client.record_event(&user, "new-checkout", "purchase");
//! }
//!
//! client.shutdown()?;
//! # Ok::<(), flagsense::Error>(())
//! ```
//!
//! A runnable demo can be found in the `demos/` directory of the repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod attributes;
mod client;
mod config;
mod configuration_store;
mod dispatcher;
mod error;
mod eval;
mod events;
mod model;
mod registry;
mod rules;
mod sharder;
mod synchronizer;
mod transport;

pub use attributes::{AttributeValue, Attributes};
pub use client::{Client, FlagRef, User};
pub use config::{ClientConfig, Environment, UnknownEnvironment};
pub use error::{Error, EvaluationError, Result};
pub use eval::Variation;
pub use registry::Registry;
