//! Order and fill persistence.
//!
//! Orders are upserted by (order_id, exchange); fills are insert-or-ignore by
//! (trade_id, exchange). History reads never fail: an unreachable database or
//! missing schema is logged and reads as empty.

use crate::types::{MarketType, OrderResult, OrderSide, OrderStatus, OrderUpdate, TradeFill};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl PersistenceError {
    pub(crate) fn from_sqlite(e: rusqlite::Error) -> Self {
        let message = e.to_string();
        if message.contains("no such table") || message.contains("unable to open") {
            PersistenceError::Unavailable(message)
        } else {
            PersistenceError::Sqlite(e)
        }
    }
}

/// Storage for confirmed orders and fills.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert or replace the order keyed by (order_id, exchange).
    async fn store_order(&self, order: &OrderResult, tenant_id: &str) -> Result<(), PersistenceError>;

    /// Apply a partial update. Returns false when no such order is stored.
    async fn update_order(&self, order_id: &str, exchange: &str, update: &OrderUpdate) -> Result<bool, PersistenceError>;

    /// Store a fill once. Returns false for a duplicate.
    async fn store_trade(&self, trade: &TradeFill, tenant_id: &str) -> Result<bool, PersistenceError>;

    async fn get_order_history(
        &self,
        tenant_id: &str,
        exchange: Option<&str>,
        symbol: Option<&str>,
        limit: usize,
    ) -> Vec<OrderResult>;

    async fn get_trade_history(
        &self,
        tenant_id: &str,
        exchange: Option<&str>,
        symbol: Option<&str>,
        limit: usize,
    ) -> Vec<TradeFill>;
}

/// SQLite-backed order store.
pub struct SqliteOrderStore {
    conn: Mutex<Connection>,
}

impl SqliteOrderStore {
    /// Open (or create) the store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite order store initialized");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("In-memory SQLite order store initialized");
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                tenant_id TEXT NOT NULL,
                order_id TEXT NOT NULL,
                exchange TEXT NOT NULL,
                client_order_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                market TEXT NOT NULL,
                status TEXT NOT NULL,
                price REAL,
                average_price REAL,
                stop_price REAL,
                quantity REAL NOT NULL,
                filled_quantity REAL NOT NULL,
                remaining_quantity REAL NOT NULL,
                time_in_force TEXT,
                reduce_only INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(order_id, exchange)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_tenant_created ON orders(tenant_id, created_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                tenant_id TEXT NOT NULL,
                trade_id TEXT NOT NULL,
                order_id TEXT NOT NULL,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                fee REAL NOT NULL,
                fee_asset TEXT NOT NULL,
                realized_pnl REAL NOT NULL,
                is_maker INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                UNIQUE(trade_id, exchange)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_tenant_time ON trades(tenant_id, timestamp DESC)",
            [],
        )?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), PersistenceError> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    fn query_orders(
        &self,
        tenant_id: &str,
        exchange: Option<&str>,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<OrderResult>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT order_id, client_order_id, exchange, symbol, side, order_type, market, status,
                        price, average_price, stop_price, quantity, filled_quantity, remaining_quantity,
                        time_in_force, reduce_only, created_at, updated_at
                 FROM orders
                 WHERE tenant_id = ?1
                   AND (?2 IS NULL OR exchange = ?2)
                   AND (?3 IS NULL OR symbol = ?3)
                 ORDER BY created_at DESC
                 LIMIT ?4",
            )
            .map_err(PersistenceError::from_sqlite)?;

        let rows = stmt
            .query_map(
                params![tenant_id, exchange, symbol.map(str::to_uppercase), limit as i64],
                order_from_row,
            )
            .map_err(PersistenceError::from_sqlite)?;
        let orders = rows.filter_map(|r| decoded(r, "orders")).collect();
        Ok(orders)
    }

    fn query_trades(
        &self,
        tenant_id: &str,
        exchange: Option<&str>,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TradeFill>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT trade_id, order_id, exchange, symbol, side, price, quantity, fee, fee_asset,
                        realized_pnl, is_maker, timestamp
                 FROM trades
                 WHERE tenant_id = ?1
                   AND (?2 IS NULL OR exchange = ?2)
                   AND (?3 IS NULL OR symbol = ?3)
                 ORDER BY timestamp DESC
                 LIMIT ?4",
            )
            .map_err(PersistenceError::from_sqlite)?;

        let rows = stmt
            .query_map(
                params![tenant_id, exchange, symbol.map(str::to_uppercase), limit as i64],
                trade_from_row,
            )
            .map_err(PersistenceError::from_sqlite)?;
        let trades = rows.filter_map(|r| decoded(r, "trades")).collect();
        Ok(trades)
    }
}

/// Keep a decoded row; log and skip one that does not decode.
fn decoded<T>(row: rusqlite::Result<T>, table: &str) -> Option<T> {
    match row {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Skipping undecodable {} row: {}", table, e);
            None
        }
    }
}

fn side_from_sql(value: String) -> OrderSide {
    OrderSide::parse(&value).unwrap_or(OrderSide::Buy)
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<OrderResult> {
    let market: String = row.get(6)?;
    let status: String = row.get(7)?;
    Ok(OrderResult {
        order_id: row.get(0)?,
        client_order_id: row.get(1)?,
        exchange: row.get(2)?,
        symbol: row.get(3)?,
        side: side_from_sql(row.get(4)?),
        order_type: row.get(5)?,
        market: MarketType::parse(&market).unwrap_or_default(),
        status: OrderStatus::from(status),
        price: row.get(8)?,
        average_price: row.get(9)?,
        stop_price: row.get(10)?,
        quantity: row.get(11)?,
        filled_quantity: row.get(12)?,
        remaining_quantity: row.get(13)?,
        time_in_force: row.get(14)?,
        reduce_only: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<TradeFill> {
    Ok(TradeFill {
        trade_id: row.get(0)?,
        order_id: row.get(1)?,
        exchange: row.get(2)?,
        symbol: row.get(3)?,
        side: side_from_sql(row.get(4)?),
        price: row.get(5)?,
        quantity: row.get(6)?,
        fee: row.get(7)?,
        fee_asset: row.get(8)?,
        realized_pnl: row.get(9)?,
        is_maker: row.get(10)?,
        timestamp: row.get(11)?,
    })
}

#[async_trait]
impl OrderStore for SqliteOrderStore {
    async fn store_order(&self, order: &OrderResult, tenant_id: &str) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders (tenant_id, order_id, exchange, client_order_id, symbol, side, order_type,
                                 market, status, price, average_price, stop_price, quantity, filled_quantity,
                                 remaining_quantity, time_in_force, reduce_only, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(order_id, exchange) DO UPDATE SET
                status = excluded.status,
                price = COALESCE(excluded.price, price),
                average_price = COALESCE(excluded.average_price, average_price),
                stop_price = COALESCE(excluded.stop_price, stop_price),
                quantity = excluded.quantity,
                filled_quantity = excluded.filled_quantity,
                remaining_quantity = excluded.remaining_quantity,
                updated_at = excluded.updated_at",
            params![
                tenant_id,
                order.order_id,
                order.exchange,
                order.client_order_id,
                order.symbol.to_uppercase(),
                order.side.to_string(),
                order.order_type,
                order.market.to_string(),
                order.status.as_str(),
                order.price,
                order.average_price,
                order.stop_price,
                order.quantity,
                order.filled_quantity,
                order.remaining_quantity,
                order.time_in_force,
                order.reduce_only,
                order.created_at,
                order.updated_at,
            ],
        )
        .map_err(PersistenceError::from_sqlite)?;
        Ok(())
    }

    async fn update_order(&self, order_id: &str, exchange: &str, update: &OrderUpdate) -> Result<bool, PersistenceError> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE orders SET
                    status = COALESCE(?1, status),
                    filled_quantity = COALESCE(?2, filled_quantity),
                    remaining_quantity = COALESCE(?3, remaining_quantity),
                    average_price = COALESCE(?4, average_price),
                    updated_at = COALESCE(?5, updated_at)
                 WHERE order_id = ?6 AND exchange = ?7",
                params![
                    update.status.as_ref().map(|s| s.as_str().to_string()),
                    update.filled_quantity,
                    update.remaining_quantity,
                    update.average_price,
                    update.updated_at,
                    order_id,
                    exchange,
                ],
            )
            .map_err(PersistenceError::from_sqlite)?;
        Ok(changed > 0)
    }

    async fn store_trade(&self, trade: &TradeFill, tenant_id: &str) -> Result<bool, PersistenceError> {
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO trades (tenant_id, trade_id, order_id, exchange, symbol, side, price,
                                               quantity, fee, fee_asset, realized_pnl, is_maker, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    tenant_id,
                    trade.trade_id,
                    trade.order_id,
                    trade.exchange,
                    trade.symbol.to_uppercase(),
                    trade.side.to_string(),
                    trade.price,
                    trade.quantity,
                    trade.fee,
                    trade.fee_asset,
                    trade.realized_pnl,
                    trade.is_maker,
                    trade.timestamp,
                ],
            )
            .map_err(PersistenceError::from_sqlite)?;
        Ok(inserted > 0)
    }

    async fn get_order_history(
        &self,
        tenant_id: &str,
        exchange: Option<&str>,
        symbol: Option<&str>,
        limit: usize,
    ) -> Vec<OrderResult> {
        self.query_orders(tenant_id, exchange, symbol, limit)
            .unwrap_or_else(|e| {
                error!("Order history unavailable for {}: {}", tenant_id, e);
                Vec::new()
            })
    }

    async fn get_trade_history(
        &self,
        tenant_id: &str,
        exchange: Option<&str>,
        symbol: Option<&str>,
        limit: usize,
    ) -> Vec<TradeFill> {
        self.query_trades(tenant_id, exchange, symbol, limit)
            .unwrap_or_else(|e| {
                error!("Trade history unavailable for {}: {}", tenant_id, e);
                Vec::new()
            })
    }
}
