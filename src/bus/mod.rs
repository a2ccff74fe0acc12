//! Event bus: typed events and the priority publish/subscribe hub

pub mod bus;
pub mod event;

pub use bus::{BusStats, EventBus, EventHandler, SubscriptionId};
pub use event::{
    ConnectionNotice, ErrorNotice, Event, EventKind, EventPayload, OrderNotice, RiskNotice,
    TradeSignal, PRIORITY_CRITICAL, PRIORITY_HIGH, PRIORITY_NORMAL,
};
