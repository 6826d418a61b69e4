use std::sync::Arc;

use herald_agent::{JobLauncher, JobRegistry};

use crate::config::ControlConfig;
use crate::credentials::CredentialStore;

#[derive(Clone)]
pub struct AppState {
    pub launcher: JobLauncher,
    pub credentials: Arc<dyn CredentialStore>,
    pub config: Arc<ControlConfig>,
}

impl AppState {
    pub fn registry(&self) -> &JobRegistry {
        self.launcher.registry()
    }
}
