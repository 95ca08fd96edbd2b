//! Backend trait and types for primitive execution

mod traits;
mod types;

pub use traits::Backend;
pub use types::{ArgRole, BufferHandle, ExecArgs, Step, StreamHandle};
