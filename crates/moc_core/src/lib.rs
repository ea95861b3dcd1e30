pub mod api;
pub mod codec;
pub mod error;
pub mod ids;
pub mod registry;
pub mod schema;
pub mod time;
pub mod value;

pub use api::*;
pub use error::{MocError, MocResult};
pub use ids::*;
pub use registry::*;
pub use schema::*;
pub use time::*;
pub use value::*;
