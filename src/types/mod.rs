pub mod alert;
pub mod credentials;
pub mod event;
pub mod order;
pub mod portfolio;
pub mod raw;
pub mod risk;
pub mod ws;

pub use alert::*;
pub use credentials::*;
pub use event::*;
pub use order::*;
pub use portfolio::*;
pub use raw::*;
pub use risk::*;
pub use ws::*;
