//! Storage backends, access control, subscriptions, and the resolver that
//! ties them together. No knowledge of sockets or the wire protocol lives
//! here — see `buxtond` for that.

pub mod access;
pub mod backend;
pub mod memory;
pub mod notifier;
pub mod persistent;
pub mod resolver;

pub use access::AccessRules;
pub use backend::{BackendError, BackendModule, BackendRegistry};
pub use notifier::{ClientId, Notifier, Subscription};
pub use resolver::{Caller, ChangeNotification, Resolver, ResolverError};
