//! Products, users and orders services talking over `rabbitrpc`.
//!
//! Each service owns one exchange and exposes its data through RPC routing
//! keys there; the order service consumes the other two and announces new
//! orders with an `order.created` event.

pub mod bootstrap;
pub mod cache;
pub mod contracts;
pub mod error;
pub mod events;
pub mod orders;
pub mod products;
pub mod store;
pub mod users;

pub use cache::{Cache, MemoryCache};
pub use events::{OrderEvents, ProductEvents, UserEvents};
pub use orders::OrderService;
pub use products::ProductService;
pub use store::{MemoryRepository, Repository};
pub use users::UserService;
