pub mod feed;
pub mod routes;
