//! # camsim - Simulated Camera IOC
//!
//! This crate simulates a hardware camera data-acquisition device for
//! testing DAQ clients without beam time. The simulator stays synchronized
//! with the external timing system's multicast feed, exposes its state as
//! hot-reloadable named parameters, and persists durable parameter values
//! across restarts.
//!
//! ## Crate Structure
//!
//! - **`catalog`**: static parameter tables for the supported camera models,
//!   passed into construction as plain data.
//! - **`config`**: construction-time settings (`SimConfig`) with validation.
//! - **`driver`**: the `CameraDriver` write/read surface and the acquisition
//!   loop that turns timing events into simulated frames.
//! - **`error`**: the `CamError` enum for centralized error handling.
//! - **`snapshot`**: periodic autosave of durable parameters with
//!   fallback-on-corruption restore.
//! - **`store`**: the thread-safe named parameter store shared by the
//!   acquisition loop, the snapshot task, and external writes.
//! - **`timing`**: the multicast timing-event wire format and the background
//!   `TimestampListener`.

pub mod catalog;
pub mod config;
pub mod driver;
pub mod error;
pub mod snapshot;
pub mod store;
pub mod timing;
