use std::fmt;
use std::sync::Arc;

use crate::config::ProvidenceConfig;
use crate::derivers::Derivers;
use crate::forms::validators::ValidatorRegistry;
use crate::paginator::Paginator;
use crate::transport::Transport;

/// Services shared by every controller under one root.
pub struct Client {
    pub config: ProvidenceConfig,
    pub transport: Arc<dyn Transport>,
    pub derivers: Arc<dyn Derivers>,
    pub paginator: Arc<dyn Paginator>,
    pub validators: ValidatorRegistry,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("validators", &self.validators)
            .finish_non_exhaustive()
    }
}
