// 6.1 engine/core.rs: the engine struct. holds the authoritative ledger, the
// price cache seam, the open-position replica topic, and the fee schedule.

use crate::broker::OpenPositionTopic;
use crate::config::FeeConfig;
use crate::ledger::Ledger;
use crate::store::PriceCache;
use std::sync::Arc;

pub struct MarginEngine<C: PriceCache> {
    pub(super) ledger: Arc<Ledger>,
    pub(super) cache: Arc<C>,
    pub(super) open_positions: Arc<OpenPositionTopic>,
    pub(super) fees: FeeConfig,
}

impl<C: PriceCache> MarginEngine<C> {
    pub fn new(
        ledger: Arc<Ledger>,
        cache: Arc<C>,
        open_positions: Arc<OpenPositionTopic>,
        fees: FeeConfig,
    ) -> Self {
        Self {
            ledger,
            cache,
            open_positions,
            fees,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn fees(&self) -> &FeeConfig {
        &self.fees
    }
}
