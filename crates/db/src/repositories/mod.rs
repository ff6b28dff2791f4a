//! Repositories over the SQLite tables.
//!
//! Repositories are stateless unit structs whose methods take the pool (or
//! any executor, so they compose inside a transaction).

pub mod image_repo;
pub mod job_repo;
pub mod params_repo;

pub use image_repo::ImageRepo;
pub use job_repo::JobRepo;
pub use params_repo::ParamsRepo;
