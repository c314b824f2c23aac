pub mod central_node;
pub mod role_assigner;

pub use central_node::{CentralNode, RoleChange};
pub use role_assigner::{optimal_forwarders, RoleAssigner};
