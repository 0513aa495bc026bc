pub mod job_repo;
pub mod product_repo;
