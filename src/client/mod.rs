//! Client session facade: the only surface a rendering layer talks to.

mod event;
mod hub;
mod registry;
mod session;
mod subscription;
pub mod ws;

pub use event::ClientEvent;
pub use hub::Hub;
pub use registry::{LeaseId, SessionId, SessionRegistry};
pub use session::{ClientSession, MyRooms, Outgoing, RoomSummary};
pub use subscription::Subscription;
