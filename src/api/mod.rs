pub mod routes;
pub mod stats;
