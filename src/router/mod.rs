//! Content-based event routing
//!
//! This module provides:
//! - `DerivedEvent`: the event published after a note is enriched
//! - `Rule` / `FieldPredicate`: declarative matchers over event fields
//! - `EventRouter`: publish/subscribe bus delivering matches to handlers
//! - `LogHandler` / `WebhookHandler`: built-in rule targets

mod bus;
mod event;
mod handlers;
mod predicate;

pub use bus::{EventPublisher, EventRouter, PublishReport, SubscriptionId};
pub use event::{DerivedEvent, DerivedEventKind};
pub use handlers::{EventHandler, LogHandler, WebhookHandler};
pub use predicate::{Comparator, FieldPredicate, Rule};
