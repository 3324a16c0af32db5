//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  SwitchControl │ CompletionNotifier │ EventPublisher        │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ SwitchCli │ SimulatedSwitch │ RetryingSwitch               │ │
//! │  │ UnixNotifier │ LoggingEventPublisher │ InMemoryEventCollector│ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use netcache::adapters::{RetryingSwitch, SwitchCli};
//! use netcache::domain::ports::SwitchControl;
//!
//! let switch = RetryingSwitch::new(Arc::new(SwitchCli::new(9090)), RetryPolicy::default());
//! switch.enable_mirroring(100, cpu_port).await?;
//! ```

mod event_publisher;
mod retry;
mod simulated_switch;
mod switch_cli;
mod unix_notifier;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use retry::RetryingSwitch;
pub use simulated_switch::{SimulatedSwitch, TableEntry};
pub use switch_cli::{SwitchCli, DEFAULT_CLI};
pub use unix_notifier::UnixNotifier;
