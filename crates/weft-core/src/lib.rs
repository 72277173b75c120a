//! # weft-core
//! Chain primitives, error taxonomy and collaborator traits shared by the
//! Weft networking stack.

pub mod chain;
pub mod crypto;
pub mod error;
pub mod session;
pub mod traits;
pub mod types;

pub use chain::{BlockFactory, MemoryChain};
pub use session::StaticSessionProvider;
pub use traits::{ChainBackend, SessionInfoProvider};

#[cfg(any(test, feature = "mock"))]
pub use traits::{MockChainBackend, MockSessionInfoProvider};
