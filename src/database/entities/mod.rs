pub mod commands;
pub mod messages;
pub mod tags;

pub use commands::Model as CommandRow;
pub use messages::Model as MessageRow;
pub use tags::Model as TagRow;
pub use messages::MessageKind;
pub use tags::TagRowStatus;
