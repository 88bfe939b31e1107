//! Resource namespaces for the locator services.

mod names;
mod ranges;

pub use names::NamesResource;
pub use ranges::RangesResource;
