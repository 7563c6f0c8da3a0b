// Emergency alert lifecycle.
//
// Architecture:
// - model.rs: Alert states, sessions, delivery statuses and the presentation view
// - machine.rs: Pure state machine (events in, effects out)
// - dispatcher.rs: Per-contact delivery records with retry and offline holding
// - timer.rs: Session-scoped countdown, retry and display timers
// - channel.rs: Delivery channel capability and the HTTP call backend
// - practice.rs: Simulated delivery for practice alerts
// - engine.rs: Single-task runtime executing effects and publishing the view

pub mod channel;
pub mod dispatcher;
pub mod engine;
pub mod machine;
pub mod model;
pub mod practice;
pub mod timer;

pub use channel::{DeliveryChannel, HttpCallChannel};
pub use dispatcher::{ContactDispatcher, RetryPolicy};
pub use engine::{AlertEngine, EngineHandle};
pub use machine::{AlertStateMachine, Effect, EngineEvent, MachineConfig};
pub use model::{AlertState, AlertView, DeliveryStatus, SessionMode};
