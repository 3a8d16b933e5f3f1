pub(crate) mod read;
pub(crate) mod write;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// Outstanding pings keyed by the sequence number carried in their payload.
pub(crate) type PendingPongs = Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>;
