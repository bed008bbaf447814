//! Paper broker
//!
//! Bridge between the OrderManager and the paper exchange. The broker
//! assigns broker order ids, forwards accepted orders and cancel/replace
//! requests to the venue, and mirrors venue state and fills back into the
//! trading-system orders.

use crate::error::{EngineError, Result};
use crate::exchange::PaperExchange;
use crate::order::{OrderState, OrderType};
use crate::order_manager::{OrderFilter, OrderManager};
use chrono::Utc;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

/// Broker fee parameters: commission per share by product type, negative
/// values denoting costs
#[derive(Debug, Clone)]
pub struct BrokerParams {
    pub fee_per_share: HashMap<String, f64>,
}

impl Default for BrokerParams {
    fn default() -> Self {
        let mut fee_per_share = HashMap::new();
        fee_per_share.insert("stock".to_string(), -0.01);
        Self { fee_per_share }
    }
}

/// Paper broker used in simulations, attached to a `PaperExchange`
pub struct PaperBroker {
    broker_id: String,
    params: BrokerParams,
    next_order_id: u64,
    orders: HashMap<u64, Uuid>,
}

impl PaperBroker {
    pub fn new(broker_id: impl Into<String>, params: BrokerParams) -> Self {
        let broker_id = broker_id.into();
        let seed = Utc::now().format("%y%m%d%H%M%S").to_string();
        let base: u64 = seed.parse().unwrap_or(1) * 1_000_000 + 100;
        info!(broker_id = %broker_id, "PaperBroker initialized");
        Self {
            broker_id,
            params,
            next_order_id: base,
            orders: HashMap::new(),
        }
    }

    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    fn next_broker_order_id(&mut self) -> u64 {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }

    /// Commission for a fill: quantity times the per-share fee of the
    /// product type. Unknown product types are an error.
    pub fn commission(&self, product_type: &str, quantity: u64) -> Result<f64> {
        let fee = self.params.fee_per_share.get(product_type).ok_or_else(|| {
            EngineError::InvalidOrder(format!(
                "no fee rule for product_type {product_type}"
            ))
        })?;
        Ok(quantity as f64 * fee)
    }

    /// Send one RISK_ACCEPTED order to the exchange: assign a broker order
    /// id, transition to SENT, submit, record the exchange order id.
    pub fn send_order(
        &mut self,
        oms: &mut OrderManager,
        exchange: &mut PaperExchange,
        uuid: Uuid,
    ) -> Result<()> {
        let (product_type, symbol, side, quantity, order_type, limit_price) = {
            let order = oms.order(uuid).ok_or(EngineError::UnknownOrder(uuid))?;
            if order.state() != OrderState::RiskAccepted {
                return Err(EngineError::InvalidOrder(format!(
                    "order not in RISK_ACCEPTED state, cannot send: {uuid}"
                )));
            }
            (
                order.product_type.clone(),
                order.symbol.clone(),
                order.buy_sell,
                order.quantity(),
                order.order_type(),
                order.limit_price(),
            )
        };

        let broker_order_id = self.next_broker_order_id();
        info!(%uuid, broker_order_id, "sending order to exchange");
        oms.change_state(uuid, OrderState::Sent)?;
        let exchange_order_id =
            exchange.receive_order(&product_type, &symbol, side, quantity, order_type, limit_price);
        let order = oms.order_mut(uuid)?;
        order.broker_order_id = Some(broker_order_id);
        order.exchange_order_id = Some(exchange_order_id);
        self.orders.insert(broker_order_id, uuid);
        Ok(())
    }

    /// Forward every pending cancel request, replace request and accepted
    /// order to the exchange, in that order
    pub fn send_orders(&mut self, oms: &mut OrderManager, exchange: &mut PaperExchange) -> Result<()> {
        self.send_cancel_requested(oms, exchange)?;
        self.send_replace_requested(oms, exchange)?;
        self.send_risk_accepted(oms, exchange)
    }

    fn send_cancel_requested(
        &mut self,
        oms: &mut OrderManager,
        exchange: &mut PaperExchange,
    ) -> Result<()> {
        let uuids: Vec<Uuid> = oms
            .orders_list(&OrderFilter::new().state(OrderState::CancelRequested))
            .iter()
            .map(|o| o.uuid())
            .collect();
        for uuid in uuids {
            let exchange_order_id = oms
                .order(uuid)
                .and_then(|o| o.exchange_order_id)
                .ok_or_else(|| {
                    EngineError::InvalidOrder(format!(
                        "cannot cancel order that never reached the exchange: {uuid}"
                    ))
                })?;
            oms.change_state(uuid, OrderState::CancelSent)?;
            exchange.receive_cancel(exchange_order_id);
        }
        Ok(())
    }

    fn send_replace_requested(
        &mut self,
        oms: &mut OrderManager,
        exchange: &mut PaperExchange,
    ) -> Result<()> {
        let uuids: Vec<Uuid> = oms
            .orders_list(&OrderFilter::new().state(OrderState::ReplaceRequested))
            .iter()
            .map(|o| o.uuid())
            .collect();
        for uuid in uuids {
            let (exchange_order_id, quantity, limit_price) = {
                let order = oms.order(uuid).expect("listed order");
                let exchange_order_id = order.exchange_order_id.ok_or_else(|| {
                    EngineError::InvalidOrder(format!(
                        "cannot replace order that never reached the exchange: {uuid}"
                    ))
                })?;
                (exchange_order_id, order.quantity(), order.limit_price())
            };
            oms.change_state(uuid, OrderState::ReplaceSent)?;
            exchange.receive_replace(exchange_order_id, quantity, limit_price);
        }
        Ok(())
    }

    fn send_risk_accepted(
        &mut self,
        oms: &mut OrderManager,
        exchange: &mut PaperExchange,
    ) -> Result<()> {
        let uuids: Vec<Uuid> = oms
            .orders_list(&OrderFilter::new().state(OrderState::RiskAccepted))
            .iter()
            .map(|o| o.uuid())
            .collect();
        for uuid in uuids {
            self.send_order(oms, exchange, uuid)?;
        }
        Ok(())
    }

    /// Mirror venue fills and state into the trading-system orders.
    ///
    /// For every managed order in an in-flight state, read the exchange
    /// counterpart, append any new fill (by fill id) with its commission,
    /// mark the order unbooked, and follow the venue state: SENT goes LIVE
    /// on first observation, partial fills go PARTIALLY_FILLED, completion
    /// goes FILLED, cancel and replace outcomes resolve their sent states.
    pub fn process_fills(&mut self, oms: &mut OrderManager, exchange: &PaperExchange) -> Result<()> {
        let uuids: Vec<Uuid> = oms
            .orders_list(&OrderFilter::new().states(vec![
                OrderState::Sent,
                OrderState::Live,
                OrderState::PartiallyFilled,
                OrderState::CancelSent,
                OrderState::ReplaceSent,
            ]))
            .iter()
            .map(|o| o.uuid())
            .collect();

        for uuid in uuids {
            let exchange_order_id = match oms.order(uuid).and_then(|o| o.exchange_order_id) {
                Some(id) => id,
                None => continue,
            };
            let Some(exchange_order) = exchange.get_order(exchange_order_id) else {
                continue;
            };

            // new fills first so aggregates are correct when the state closes
            let new_fills: Vec<_> = {
                let order = oms.order(uuid).expect("listed order");
                exchange_order
                    .fills
                    .iter()
                    .filter(|f| !order.has_fill(f.fill_id))
                    .copied()
                    .collect()
            };
            if !new_fills.is_empty() {
                let product_type = oms.order(uuid).expect("listed order").product_type.clone();
                for fill in new_fills {
                    let commission = self.commission(&product_type, fill.quantity)?;
                    oms.order_mut(uuid)?.add_fill(
                        fill.fill_id,
                        Utc::now(),
                        fill.bartime,
                        fill.quantity,
                        fill.price,
                        commission,
                    );
                }
                oms.set_booked(uuid, false)?;
            }

            let venue_state = exchange_order.state;
            let order_state = oms.order(uuid).expect("listed order").state();
            if venue_state != order_state && venue_state != OrderState::Sent {
                oms.change_state(uuid, venue_state)?;
            }
        }
        Ok(())
    }
}
