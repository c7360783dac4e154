//! Raw → unified record transforms.
//!
//! Pure functions with no I/O. Unparsable numeric strings read as 0, which
//! is how the venues themselves report empty fields.

use crate::connectors::binance;
use crate::types::{
    OrderSide, OrderStatus, PositionSide, RawBalance, RawOrder, RawPosition, RawTrade,
    UnifiedBalance, UnifiedOrder, UnifiedPosition, UnifiedTrade,
};
use tracing::debug;

/// Stablecoins priced at exactly 1 USD.
pub const STABLECOINS: &[&str] = &["USDT", "USDC", "BUSD", "DAI", "TUSD", "USDP", "FDUSD", "USD"];

/// USD price for an asset. Only stablecoins are priced; everything else has
/// no price source and is valued at 0.
pub fn usd_price(asset: &str) -> Option<f64> {
    let asset = asset.to_uppercase();
    STABLECOINS.contains(&asset.as_str()).then_some(1.0)
}

pub(crate) fn parse_num(value: &str) -> f64 {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn parse_opt(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v != 0.0)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Map a vendor order status onto the closed enumeration.
pub fn map_order_status(exchange: &str, status: &str) -> OrderStatus {
    match exchange {
        binance::EXCHANGE_NAME => binance::map_order_status(status),
        _ => OrderStatus::from(status.to_string()),
    }
}

fn parse_side(value: &str) -> OrderSide {
    OrderSide::parse(value).unwrap_or_else(|| {
        debug!("Unrecognised order side '{}', defaulting to buy", value);
        OrderSide::Buy
    })
}

pub fn normalize_balance(raw: &RawBalance, exchange: &str, usd_price: Option<f64>) -> UnifiedBalance {
    let available = parse_num(&raw.free);
    let (total, locked) = match raw.total.as_deref() {
        Some(total) => {
            let total = parse_num(total);
            (total, (total - available).max(0.0))
        }
        None => {
            let locked = parse_num(&raw.locked);
            (available + locked, locked)
        }
    };

    UnifiedBalance {
        exchange: exchange.to_string(),
        asset: raw.asset.trim().to_uppercase(),
        total,
        available,
        locked,
        usd_value: total * usd_price.unwrap_or(0.0),
        market: raw.market,
        timestamp: now_ms(),
    }
}

pub fn normalize_position(raw: &RawPosition, exchange: &str) -> UnifiedPosition {
    let signed_size = parse_num(&raw.position_amt);
    let side = match raw.position_side.to_ascii_uppercase().as_str() {
        "LONG" => PositionSide::Long,
        "SHORT" => PositionSide::Short,
        _ if signed_size < 0.0 => PositionSide::Short,
        _ => PositionSide::Long,
    };
    let size = signed_size.abs();
    let entry_price = parse_num(&raw.entry_price);
    let mark_price = parse_num(&raw.mark_price);

    UnifiedPosition {
        exchange: exchange.to_string(),
        symbol: raw.symbol.to_uppercase(),
        side,
        size,
        entry_price,
        mark_price,
        unrealized_pnl: (mark_price - entry_price) * size * side.sign(),
        leverage: parse_opt(raw.leverage.as_deref()),
        liquidation_price: parse_opt(raw.liquidation_price.as_deref()),
        timestamp: if raw.update_time > 0 { raw.update_time } else { now_ms() },
    }
}

pub fn normalize_order(raw: &RawOrder, exchange: &str) -> UnifiedOrder {
    UnifiedOrder {
        exchange: exchange.to_string(),
        order_id: raw.order_id.clone(),
        client_order_id: raw.client_order_id.clone(),
        symbol: raw.symbol.to_uppercase(),
        side: parse_side(&raw.side),
        order_type: raw.order_type.to_uppercase(),
        price: parse_num(&raw.price),
        quantity: parse_num(&raw.orig_qty),
        filled_quantity: parse_num(&raw.executed_qty),
        status: map_order_status(exchange, &raw.status),
        market: raw.market,
        timestamp: if raw.time > 0 { raw.time } else { now_ms() },
    }
}

/// Realized PnL stays 0 unless the venue reports it; deriving it would need
/// position tracking across fills.
pub fn normalize_trade(raw: &RawTrade, exchange: &str) -> UnifiedTrade {
    UnifiedTrade {
        exchange: exchange.to_string(),
        trade_id: raw.trade_id.clone(),
        order_id: raw.order_id.clone(),
        symbol: raw.symbol.to_uppercase(),
        side: parse_side(&raw.side),
        price: parse_num(&raw.price),
        quantity: parse_num(&raw.qty),
        fee: parse_num(&raw.commission),
        fee_asset: raw.commission_asset.to_uppercase(),
        realized_pnl: raw.realized_pnl.as_deref().map(parse_num).unwrap_or(0.0),
        is_maker: raw.is_maker,
        market: raw.market,
        timestamp: if raw.time > 0 { raw.time } else { now_ms() },
    }
}
