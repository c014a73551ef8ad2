pub mod link;
pub mod mock;
pub mod protocol;

pub use link::{BreathalyzerPort, SerialEndpoint, SerialLink};
pub use mock::ScriptedLink;
pub use protocol::{Command, DeviceEvent, ReadingStatus};
