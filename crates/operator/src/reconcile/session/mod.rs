pub mod controller;
pub mod naming;
pub mod workload;

pub use controller::{reconcile_session, reconcile_session_by_name};
pub use naming::ResourceNaming;
