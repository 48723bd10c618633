pub mod channel;
pub mod engine;
pub mod errors;
pub mod object;
pub mod persist;
pub mod registry;
pub mod scheduler;
pub mod scripts;
pub mod store;
pub mod time;
pub mod trigger;

pub use engine::{CallOpts, EventEngine};
pub use errors::StoreError;
pub use object::ObjRef;
pub use scripts::{Namespace, Outcome};
