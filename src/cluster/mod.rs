//! Clients for the two asynchronous cluster protocols: the resource manager
//! (allocation and completion of containers) and the per-node managers
//! (starting and stopping the processes inside them), plus the minimal view
//! of the cluster filesystem needed to localize container resources.

pub mod fs;
pub mod nm;
pub mod rm;
pub mod types;
