use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::config::GateConfig;
use crate::kv::KvStore;
use crate::model::ModelBackend;
use crate::queue::QueuedJob;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub kv: KvStore,
    pub cfg: Arc<GateConfig>,
    pub model: ModelBackend,
    pub queue_tx: mpsc::Sender<QueuedJob>,
}
