use std::path::PathBuf;
use std::sync::Arc;

use crate::coordinator::Engine;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub pool: Pool,
    /// Drop file read by operator-triggered runs.
    pub items_path: Option<PathBuf>,
}
