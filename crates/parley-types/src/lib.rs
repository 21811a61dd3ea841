pub mod codes;
pub mod events;
pub mod identity;
pub mod models;

pub use codes::Code;
pub use identity::Identity;
