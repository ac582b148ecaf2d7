// 9.0: payloads that leave the core. live subscribers get trade ticks on the
// per-asset channel (the Trade wire shape itself); liquidated users get a
// notice addressed by user ID through the notification sink.

use crate::types::{PositionId, Price, Quote};
use serde::{Deserialize, Serialize};

/// Sent to the owning user when the monitor force-closes a position.
/// Wire shape: `{"positionId": 7, "closedPrice": "94", "pnl": "-60"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidationNotice {
    pub position_id: PositionId,
    pub closed_price: Price,
    pub pnl: Quote,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn notice_wire_shape() {
        let notice = LiquidationNotice {
            position_id: PositionId(7),
            closed_price: Price::new_unchecked(dec!(94)),
            pnl: Quote::new(dec!(-60)),
        };

        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["positionId"], 7);
        assert_eq!(json["closedPrice"], "94");
        assert_eq!(json["pnl"], "-60");
    }
}
