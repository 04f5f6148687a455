pub use std::collections::{HashMap, HashSet};
pub use std::fmt::Debug;
pub use std::net::SocketAddr;
pub use std::sync::Arc;

pub use anyhow::Context as AnyhowContext;
pub use tracing::{debug, error, info, trace, warn};
