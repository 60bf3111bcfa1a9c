pub mod clock;
pub mod config;
pub mod coordinator;
pub mod correlator;
pub mod counter;
pub mod error;
pub mod facade;
pub mod ffi;
pub mod marker;
pub mod provider;
pub mod reader;
pub mod reading;
pub mod ringbuffer;

pub use clock::{ClockSource, PrecisionClock};
pub use config::MeterConfig;
pub use correlator::CorrelatedCheckpoint;
pub use error::{NembError, NembResult};
pub use facade::{new_meter, EnergyDifference, Meter};
pub use reading::{DomainId, EnergyReading, HardwareClass, ProviderSpec, SourceKind, SynchronizedReading};
