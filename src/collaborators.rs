//! Contracts for the systems the scheduler calls out to.
//!
//! The engine only ever holds these behind `Arc<dyn _>` and refers to
//! orders by id. None of their failures abort a lifecycle transition.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{OrderRef, ResourceId, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Power {
    On,
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("device rejected command: {0}")]
    Rejected(String),
    #[error("device status timed out after {0}ms")]
    TimedOut(u128),
}

/// Relay control for an instrument.
pub trait DeviceControl: Send + Sync {
    fn get_status(&self, resource: ResourceId) -> Result<Power, DeviceError>;
    fn activate(&self, resource: ResourceId) -> Result<(), DeviceError>;
    fn deactivate(&self, resource: ResourceId) -> Result<(), DeviceError>;
}

/// Actual usage handed to pricing, with the schedule discount already folded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub span: Span,
    pub discount_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub policy: String,
    pub cost_cents: i64,
    pub subsidy_cents: i64,
}

pub trait Pricing: Send + Sync {
    /// Cheapest applicable price policy for the usage, or `None` when the
    /// resource has no policy in effect on `as_of`.
    fn cheapest_policy(
        &self,
        resource: ResourceId,
        usage: &UsageWindow,
        as_of: NaiveDate,
    ) -> Option<PriceQuote>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("order {order} could not be completed: {message}")]
pub struct CollaboratorError {
    pub order: OrderRef,
    pub message: String,
}

/// Order lines that reservations are booked against.
pub trait OrderBook: Send + Sync {
    fn complete(&self, order: OrderRef, quote: Option<&PriceQuote>) -> Result<(), CollaboratorError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub pricing: Arc<dyn Pricing>,
    pub device: Arc<dyn DeviceControl>,
    pub orders: Arc<dyn OrderBook>,
}

impl Collaborators {
    /// Standalone wiring: no pricing, no hardware, orders only logged.
    pub fn detached() -> Self {
        Self {
            pricing: Arc::new(NoPricing),
            device: Arc::new(NoDevice),
            orders: Arc::new(LoggedOrders),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

pub struct NoPricing;

impl Pricing for NoPricing {
    fn cheapest_policy(&self, _: ResourceId, _: &UsageWindow, _: NaiveDate) -> Option<PriceQuote> {
        None
    }
}

/// Resources with no relay attached. Always reports off.
pub struct NoDevice;

impl DeviceControl for NoDevice {
    fn get_status(&self, _: ResourceId) -> Result<Power, DeviceError> {
        Ok(Power::Off)
    }

    fn activate(&self, _: ResourceId) -> Result<(), DeviceError> {
        Ok(())
    }

    fn deactivate(&self, _: ResourceId) -> Result<(), DeviceError> {
        Ok(())
    }
}

pub struct LoggedOrders;

impl OrderBook for LoggedOrders {
    fn complete(&self, order: OrderRef, quote: Option<&PriceQuote>) -> Result<(), CollaboratorError> {
        info!(%order, policy = quote.map(|q| q.policy.as_str()), "order complete");
        Ok(())
    }
}
