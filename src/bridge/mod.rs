mod identity;
mod registry;
mod portal;
mod relations;
mod matrix_handler;
mod remote_handler;
mod lifecycle;

pub use identity::*;
pub use portal::{Portal, PORTAL_EVENT_BUFFER};
pub use registry::*;
