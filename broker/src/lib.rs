//! Broker abstraction for the calibration service.
//!
//! The service consumes a narrow channel/publish/consume surface; everything
//! AMQP-specific lives behind the `bus` traits so the session machinery can
//! run against an in-memory double in tests. `amqp` is the lapin-backed
//! production implementation, `topology` the bit-exact exchange and queue
//! names shared with the producing services.

pub mod amqp;
pub mod bus;
pub mod topology;

pub use bus::{BusChannel, BusProvider, Delivery, ExchangeType, MessageBus};
