pub mod analytics;
pub mod api_router;
pub mod config;
pub mod directory;
pub mod learn;
pub mod shared;

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
