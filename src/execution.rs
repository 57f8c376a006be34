use crate::models::PositionSide;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Order for {symbol} rejected: {reason}")]
    Rejected { symbol: String, reason: String },
}

/// Where the engine sends its open and close orders.
pub trait ExecutionVenue {
    fn place_order(&mut self, request: &OrderRequest) -> Result<Fill, ExecutionError>;

    fn close_position(
        &mut self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<Fill, ExecutionError>;
}

/// Fills every order in full at the quoted price.
#[derive(Debug, Default)]
pub struct SimulatedExecution {
    next_order: u64,
}

impl SimulatedExecution {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_order_id(&mut self, symbol: &str) -> String {
        self.next_order += 1;
        format!("sim-{}-{}", symbol, self.next_order)
    }

    pub fn orders_filled(&self) -> u64 {
        self.next_order
    }
}

impl ExecutionVenue for SimulatedExecution {
    fn place_order(&mut self, request: &OrderRequest) -> Result<Fill, ExecutionError> {
        Ok(Fill {
            order_id: self.next_order_id(&request.symbol),
            price: request.price,
            quantity: request.quantity,
        })
    }

    fn close_position(
        &mut self,
        symbol: &str,
        _side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<Fill, ExecutionError> {
        Ok(Fill {
            order_id: self.next_order_id(symbol),
            price,
            quantity,
        })
    }
}
