pub mod postgres;

pub use postgres::PostgresRepo;
