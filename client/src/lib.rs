//! # GVT Synchronization Client
//!
//! The synchronization core of a networked peer. Every peer exchanges
//! timestamped movement events together with a claimed time, and an event is
//! only executed once no peer can still deliver anything earlier: the global
//! virtual time (GVT) gate.
//!
//! ## Module Organization
//!
//! ### Clock (`clock`)
//! The clock interface the scheduler reads, with a wall-clock implementation
//! (`GameTime`) and an explicitly advanced one (`ManualClock`).
//!
//! ### Game Objects (`game`)
//! The narrow interface to whatever owns the simulated objects, the recorder
//! used by replay, and the `Stage` that groups them behind one lock.
//!
//! ### Scheduler (`scheduler`)
//! Per-source event queues, claimed times, GVT computation and the event
//! handler (`EventManager`).
//!
//! ### Network (`network`)
//! The transport adapter: handshake, periodic outbound batches and the
//! subscriber that feeds broadcast batches into the scheduler.
//!
//! ### Replay (`replay`)
//! Records executed movements and plays them back on a separate clock,
//! leaving and rejoining live synchronization around playback.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::clock::{Clock, GameTime};
//! use client::game::Characters;
//! use client::network::{Client, ClientConfig};
//! use client::scheduler::EventManager;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let clock: Arc<dyn Clock> = Arc::new(GameTime::new(1.0));
//! let (manager, _notices) = EventManager::new("A", clock, Characters::new());
//! let manager = Arc::new(manager);
//!
//! let client = Arc::new(Client::new(&ClientConfig::default(), Arc::clone(&manager)).await?);
//! client.connect().await?;
//!
//! let batches = client.spawn_subscriber();
//! let receiver = Arc::clone(&client);
//! tokio::spawn(async move { receiver.subscribe_handler(batches).await });
//! tokio::spawn(async move { manager.keep_executing_events(Duration::from_millis(10)).await });
//!
//! client.send_handler().await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod game;
pub mod network;
pub mod replay;
pub mod scheduler;
