//! Built-in activity behaviors.

pub mod common;
pub mod event;
pub mod gateway;
pub mod multi_instance;
pub mod subprocess;
pub mod task;

pub use common::{Automatic, NoneEndEvent, TerminateEndEvent, WaitState};
pub use event::{BoundaryEvent, CompensationThrowEvent, ErrorEndEvent, IntermediateCatchEvent, SignalThrowEvent};
pub use gateway::{ExclusiveGateway, InclusiveGateway, ParallelGateway};
pub use multi_instance::{Cardinality, MultiInstance};
pub use subprocess::SubProcess;
pub use task::ServiceTask;
