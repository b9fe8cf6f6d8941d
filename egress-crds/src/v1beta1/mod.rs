pub mod endpoint;
pub mod gateway;
pub mod policy;
pub mod tunnel;
