use std::sync::Arc;

use crate::detect::AnomalyClassifier;
use crate::executor::ScriptExecutor;
use crate::storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub executor: ScriptExecutor,
    pub classifier: Arc<dyn AnomalyClassifier>,
}
