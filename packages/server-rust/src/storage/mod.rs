//! [`TranslationRepo`](crate::usecase::TranslationRepo) implementations.
//!
//! - [`MemoryTranslationRepo`]: process-local history, used by tests and
//!   when no database URL is configured
//! - [`PostgresTranslationRepo`]: `history` table via `sqlx` (feature `postgres`)

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryTranslationRepo;
#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresTranslationRepo};
