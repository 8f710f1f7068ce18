//! Domain types and contracts for the Cairn metadata graph store.

pub mod api;
pub mod clock;
pub mod condition;
pub mod error;
pub mod ids;
pub mod manifest;
pub mod model;
pub mod registry;
pub mod repository;
pub mod value;

pub use api::*;
pub use clock::*;
pub use condition::*;
pub use error::{GraphError, GraphResult};
pub use ids::*;
pub use manifest::*;
pub use model::*;
pub use registry::*;
pub use repository::*;
pub use value::*;
