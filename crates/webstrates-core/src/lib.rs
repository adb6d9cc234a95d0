//! # Webstrates Sync Core
//!
//! Document model and synchronization primitives for Webstrates clients.
//!
//! This crate provides:
//! - Canonical document tree (`Text | Element`) and its JsonML wire form
//! - HTML codec with the script/style entity policy
//! - `json0` operation components and an apply routine
//! - Tree differ producing directly submittable `json0` operations
//! - Named-event bus with per-subscription filter pipelines

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod diff;
pub mod events;
pub mod json0;
pub mod tree;

pub use codec::{parse, serialize, CodecError};
pub use diff::{diff, skeleton_reset};
pub use events::{
    EventBus, EventError, Filter, Handler, SubscribeOptions, Subscription, TriggerOptions,
};
pub use json0::{apply, ApplyError, Component, Op, PathSegment};
pub use tree::{normalize, Attributes, Element, Node, TreeError};
