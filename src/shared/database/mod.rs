pub mod connection;

pub use connection::{create_in_memory_connection, create_tables, initialize_database};
