//! Streaming feed connection and wire protocol

pub mod client;
pub mod events;

pub use client::{ConnectionManager, SubscriptionHandle, WsError};
pub use events::{ControlFrame, ControlType, EventError, FeedEvent, WireFrame};
