pub mod nodemanager;

pub use nodemanager::{ClientError, NodeManagerApi, NodeManagerClient};
