pub mod clients;
pub mod dispatcher;

pub use clients::{ChatClient, ChatEvent, RoomClient, RoomEvent};
pub use dispatcher::Dispatcher;
