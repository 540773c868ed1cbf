pub use sandbox_types::{CoreError, CoreResult};
