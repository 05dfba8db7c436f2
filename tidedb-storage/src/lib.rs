pub mod conf;
pub mod error;
pub mod ff;
pub mod index;
pub mod serde;
pub mod symbol;
pub mod vm;

pub mod prelude {
    pub use crate::conf::*;
    pub use crate::error::*;
    pub use crate::ff::{FilesFacade, FilesFacadeRef, OsFilesFacade};
    pub use crate::symbol::*;
    pub use crate::vm::*;
}
