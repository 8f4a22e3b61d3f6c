//! Shared application state for the API server

use std::sync::Arc;

use treasury_engine::{PayjoinNegotiationEngine, SigningRequestLedger};

/// Shared application state passed to all handlers
#[derive(Clone)]
pub struct AppState {
    /// BIP78 receiver negotiation engine
    pub payjoin: Arc<PayjoinNegotiationEngine>,
    /// Threshold signing ledger
    pub ledger: Arc<SigningRequestLedger>,
}

impl AppState {
    pub fn new(payjoin: Arc<PayjoinNegotiationEngine>, ledger: Arc<SigningRequestLedger>) -> Self {
        Self { payjoin, ledger }
    }
}
