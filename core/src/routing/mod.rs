//! Routing: hop budgets, next-hop resolution through cached gateways, local
//! delivery and connection bridging between networks

pub mod router;

pub use router::{DropReason, LocalDispatch, NextHop, RouteOutcome, RouterManager};
