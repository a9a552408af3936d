/*
 * Responsibility
 * - Router に紐づける共有コンテキスト (AppState)
 *   - settings: 検証済み設定, limiter: レートリミッタ登録簿
 *   - tickets / dispatcher / probe / replicator: 外部コラボレータ
 * - Clone 前提で持つ (内部は Arc/Clone cheap)
 */
use std::sync::Arc;

use crate::limiter::RateLimiterStore;
use crate::pipeline::Settings;
use crate::services::forward::ForwardingDispatcher;
use crate::services::probe::ResourceProbe;
use crate::services::replicate::UserReplicator;
use crate::services::ticket::TicketClient;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub limiter: Arc<RateLimiterStore>,
    pub tickets: Arc<dyn TicketClient>,
    pub dispatcher: Arc<ForwardingDispatcher>,
    pub probe: Arc<dyn ResourceProbe>,
    pub replicator: Option<Arc<dyn UserReplicator>>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        limiter: Arc<RateLimiterStore>,
        tickets: Arc<dyn TicketClient>,
        dispatcher: Arc<ForwardingDispatcher>,
        probe: Arc<dyn ResourceProbe>,
        replicator: Option<Arc<dyn UserReplicator>>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            limiter,
            tickets,
            dispatcher,
            probe,
            replicator,
        }
    }
}
