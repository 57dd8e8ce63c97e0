//! Background services
//!
//! Two long-lived workers keep the gateway healthy:
//!
//! - the tagset cache refresh worker pulls newly created tagsets and series
//!   into memory on a short interval, and
//! - the housekeeping worker prunes retention-expired orphans and compacts
//!   the cache on a long one.
//!
//! Both run under the [`framework::ServiceManager`] and pace themselves with
//! the [`scheduler::PeriodicRunner`].

pub mod framework;
pub mod housekeeping;
pub mod refresh;
pub mod scheduler;

pub use framework::{Service, ServiceError, ServiceManager, ServiceStatus};
pub use housekeeping::{Housekeeper, HousekeepingService};
pub use refresh::TagsetRefreshService;
pub use scheduler::PeriodicRunner;
