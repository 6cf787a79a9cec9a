pub mod agenticsession;
pub mod projectsettings;
pub mod template;

pub use agenticsession::*;
pub use projectsettings::*;
pub use template::*;
