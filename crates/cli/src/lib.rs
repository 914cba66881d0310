//! digestd - batched notification digests from the command line
//!
//! The binary queues events on timelines and runs the scheduler that
//! turns due timelines into notifications.

pub mod cmd;
pub mod daemon;
pub mod ipc;
pub mod locks;
pub mod logging;
pub mod notify;
pub mod retry;
pub mod scheduler;
pub mod system_config;
pub mod util;

pub use notify::{Event, Notification, Notifier, Renderer};
pub use scheduler::{Scheduler, SchedulerSettings, TickReport};
